use nw_core::{Address, Direction, FwError, Verdict};
use serde_json::Value;

const VERDICT_KEYS: &[&str] = &[
    "accept",
    "drop",
    "reject",
    "masquerade",
    "dnat",
    "snat",
    "jump",
    "goto",
    "return",
    "queue",
];

/// `<protocol> <field> == <value>` as found in a rule's expression list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMatch {
    pub protocol: String,
    pub field: String,
    pub value: String,
}

impl FieldMatch {
    pub fn new(protocol: &str, field: &str, value: impl Into<String>) -> Self {
        Self {
            protocol: protocol.to_string(),
            field: field.to_string(),
            value: value.into(),
        }
    }
}

/// Structural view of one listed rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedRule {
    pub handle: u64,
    pub matches: Vec<FieldMatch>,
    pub verdict: Option<String>,
}

/// Which rules a removal should take out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulePredicate {
    pub matches: Vec<FieldMatch>,
    pub verdict: Option<String>,
}

impl RulePredicate {
    /// Rules matching `address` on the given side with the given verdict
    pub fn address(direction: Direction, address: &Address, verdict: Verdict) -> Self {
        Self {
            matches: vec![FieldMatch::new(
                address.protocol(),
                direction.field(),
                address.to_string(),
            )],
            verdict: Some(verdict.as_str().to_string()),
        }
    }

    pub fn matches(&self, rule: &ListedRule) -> bool {
        if let Some(verdict) = &self.verdict {
            if rule.verdict.as_deref() != Some(verdict.as_str()) {
                return false;
            }
        }
        self.matches.iter().all(|m| rule.matches.contains(m))
    }
}

/// Parse `nft -a -j list chain …` output into structural rules
pub fn parse_chain_listing(json: &str) -> Result<Vec<ListedRule>, FwError> {
    let rules = listing_items(json)?
        .iter()
        .filter_map(|item| item.get("rule"))
        .filter_map(|rule| {
            let handle = rule.get("handle")?.as_u64()?;
            let exprs = rule
                .get("expr")
                .and_then(|e| e.as_array())
                .map(Vec::as_slice)
                .unwrap_or_default();

            Some(ListedRule {
                handle,
                matches: exprs.iter().filter_map(parse_match).collect(),
                verdict: exprs.iter().find_map(parse_verdict),
            })
        })
        .collect();

    Ok(rules)
}

/// `(family, name)` of each table in a `-j list tables` listing
pub fn parse_table_listing(json: &str) -> Result<Vec<(String, String)>, FwError> {
    let tables = listing_items(json)?
        .iter()
        .filter_map(|item| item.get("table"))
        .filter_map(|table| {
            let family = table.get("family")?.as_str()?;
            let name = table.get("name")?.as_str()?;
            Some((family.to_string(), name.to_string()))
        })
        .collect();

    Ok(tables)
}

/// Chains and rules in a `-j list table` listing
pub fn count_table_objects(json: &str) -> Result<(usize, usize), FwError> {
    let items = listing_items(json)?;
    let count = |key: &str| items.iter().filter(|item| item.get(key).is_some()).count();
    Ok((count("chain"), count("rule")))
}

fn listing_items(json: &str) -> Result<Vec<Value>, FwError> {
    let mut parsed: Value = serde_json::from_str(json)?;
    match parsed.get_mut("nftables").map(Value::take) {
        Some(Value::Array(items)) => Ok(items),
        _ => Ok(vec![]),
    }
}

pub fn matching_handles(rules: &[ListedRule], predicate: &RulePredicate) -> Vec<u64> {
    rules
        .iter()
        .filter(|r| predicate.matches(r))
        .map(|r| r.handle)
        .collect()
}

fn parse_match(expr: &Value) -> Option<FieldMatch> {
    let m = expr.get("match")?;
    if m.get("op").and_then(|o| o.as_str()) != Some("==") {
        return None;
    }
    let payload = m.get("left")?.get("payload")?;
    let protocol = payload.get("protocol")?.as_str()?;
    let field = payload.get("field")?.as_str()?;
    let value = normalize_value(m.get("right")?)?;

    Some(FieldMatch::new(protocol, field, value))
}

/// Addresses are compared in canonical form so `10.0.0.0/8` matches however nft spells it
fn normalize_value(right: &Value) -> Option<String> {
    match right {
        Value::String(s) => Some(canonical_address(s).unwrap_or_else(|| s.clone())),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => {
            let prefix = obj.get("prefix")?;
            let addr = prefix.get("addr")?.as_str()?;
            let len = prefix.get("len")?.as_u64()?;
            let raw = format!("{}/{}", addr, len);
            Some(canonical_address(&raw).unwrap_or(raw))
        }
        _ => None,
    }
}

fn canonical_address(raw: &str) -> Option<String> {
    raw.parse::<Address>().ok().map(|a| a.to_string())
}

fn parse_verdict(expr: &Value) -> Option<String> {
    let obj = expr.as_object()?;
    VERDICT_KEYS
        .iter()
        .find(|key| obj.contains_key(**key))
        .map(|key| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"{"nftables": [
        {"metainfo": {"version": "1.0.9", "json_schema_version": 1}},
        {"chain": {"family": "inet", "table": "filter", "name": "input", "handle": 1}},
        {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 4,
            "expr": [{"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "saddr"}}, "right": "203.0.113.7"}}, {"drop": null}]}},
        {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 5,
            "expr": [{"match": {"op": "==", "left": {"payload": {"protocol": "tcp", "field": "dport"}}, "right": 22}}, {"accept": null}]}},
        {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 9,
            "expr": [{"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "saddr"}}, "right": "203.0.113.7"}}, {"counter": {"packets": 0, "bytes": 0}}, {"drop": null}]}},
        {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 11,
            "expr": [{"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "saddr"}}, "right": {"prefix": {"addr": "10.0.0.0", "len": 8}}}}, {"drop": null}]}},
        {"rule": {"family": "inet", "table": "filter", "chain": "input", "handle": 12,
            "expr": [{"match": {"op": "==", "left": {"payload": {"protocol": "ip", "field": "saddr"}}, "right": "203.0.113.7"}}, {"accept": null}]}}
    ]}"#;

    #[test]
    fn parses_rules_with_handles() {
        let rules = parse_chain_listing(LISTING).unwrap();
        assert_eq!(rules.len(), 5);
        assert_eq!(rules[0].handle, 4);
        assert_eq!(rules[0].verdict.as_deref(), Some("drop"));
        assert_eq!(rules[1].matches, vec![FieldMatch::new("tcp", "dport", "22")]);
        assert_eq!(rules[3].matches[0].value, "10.0.0.0/8");
    }

    #[test]
    fn predicate_selects_all_duplicates_with_same_verdict() {
        let rules = parse_chain_listing(LISTING).unwrap();
        let address: Address = "203.0.113.7".parse().unwrap();
        let predicate = RulePredicate::address(Direction::Source, &address, Verdict::Drop);

        assert_eq!(matching_handles(&rules, &predicate), vec![4, 9]);
    }

    #[test]
    fn predicate_matches_cidr_prefix() {
        let rules = parse_chain_listing(LISTING).unwrap();
        let address: Address = "10.0.0.0/8".parse().unwrap();
        let predicate = RulePredicate::address(Direction::Source, &address, Verdict::Drop);

        assert_eq!(matching_handles(&rules, &predicate), vec![11]);
    }

    #[test]
    fn destination_predicate_ignores_source_rules() {
        let rules = parse_chain_listing(LISTING).unwrap();
        let address: Address = "203.0.113.7".parse().unwrap();
        let predicate = RulePredicate::address(Direction::Destination, &address, Verdict::Drop);

        assert!(matching_handles(&rules, &predicate).is_empty());
    }

    #[test]
    fn counts_chain_and_rule_objects() {
        assert_eq!(count_table_objects(LISTING).unwrap(), (1, 5));
    }

    #[test]
    fn parses_table_names() {
        let json = r#"{"nftables": [
            {"metainfo": {"version": "1.0.9"}},
            {"table": {"family": "inet", "name": "filter", "handle": 1}},
            {"table": {"family": "ip", "name": "nat", "handle": 2}}
        ]}"#;
        assert_eq!(
            parse_table_listing(json).unwrap(),
            vec![
                ("inet".to_string(), "filter".to_string()),
                ("ip".to_string(), "nat".to_string())
            ]
        );
    }

    #[test]
    fn empty_listing_has_no_rules() {
        assert!(parse_chain_listing(r#"{"nftables": []}"#).unwrap().is_empty());
        assert!(parse_chain_listing("not json").is_err());
    }
}
