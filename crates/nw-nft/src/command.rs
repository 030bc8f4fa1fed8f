use nw_core::{HookSpec, Position, TableRef, Target};
use std::fmt;

/// One invocation of the nft binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NftCommand {
    pub args: Vec<String>,
    /// Fed to `nft -f -`
    pub stdin: Option<String>,
}

impl NftCommand {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn add_table(table: &TableRef) -> Self {
        Self::new(["add", "table", table.family.as_str(), table.name.as_str()])
    }

    pub fn delete_table(table: &TableRef) -> Self {
        Self::new(["delete", "table", table.family.as_str(), table.name.as_str()])
    }

    pub fn flush_table(table: &TableRef) -> Self {
        Self::new(["flush", "table", table.family.as_str(), table.name.as_str()])
    }

    /// The hook body is passed as a single argument so nft's option parser
    /// never sees a negative priority
    pub fn add_chain(chain: &Target, hook: Option<&HookSpec>) -> Self {
        let mut cmd = Self::new(["add", "chain", chain.family.as_str(), chain.table.as_str(), chain.chain.as_str()]);
        if let Some(hook) = hook {
            cmd.args.push(hook.render());
        }
        cmd
    }

    pub fn delete_chain(chain: &Target) -> Self {
        Self::new(["delete", "chain", chain.family.as_str(), chain.table.as_str(), chain.chain.as_str()])
    }

    pub fn flush_chain(chain: &Target) -> Self {
        Self::new(["flush", "chain", chain.family.as_str(), chain.table.as_str(), chain.chain.as_str()])
    }

    pub fn flush_ruleset() -> Self {
        Self::new(["flush", "ruleset"])
    }

    /// `add rule` appends, `insert rule` without a handle lands at the head
    pub fn rule(chain: &Target, position: Position, statement: &[String]) -> Self {
        let verb = match position {
            Position::Append => "add",
            Position::Insert => "insert",
        };
        let mut cmd = Self::new([verb, "rule", chain.family.as_str(), chain.table.as_str(), chain.chain.as_str()]);
        cmd.args.extend(statement.iter().cloned());
        cmd
    }

    pub fn delete_rule(chain: &Target, handle: u64) -> Self {
        Self::new([
            "delete".to_string(),
            "rule".to_string(),
            chain.family.as_str().to_string(),
            chain.table.clone(),
            chain.chain.clone(),
            "handle".to_string(),
            handle.to_string(),
        ])
    }

    /// `create` rather than `add`: nft refuses an existing set
    pub fn create_set(table: &TableRef, name: &str, element_type: &str, flags: &[String]) -> Self {
        let mut body = format!("{{ type {} ;", element_type);
        if !flags.is_empty() {
            body.push_str(&format!(" flags {} ;", flags.join(",")));
        }
        body.push_str(" }");
        Self::new(["create", "set", table.family.as_str(), table.name.as_str(), name, body.as_str()])
    }

    pub fn create_map(table: &TableRef, name: &str, key_type: &str, value_type: &str) -> Self {
        let body = format!("{{ type {} : {} ; }}", key_type, value_type);
        Self::new(["create", "map", table.family.as_str(), table.name.as_str(), name, body.as_str()])
    }

    pub fn delete_set(table: &TableRef, name: &str) -> Self {
        Self::new(["delete", "set", table.family.as_str(), table.name.as_str(), name])
    }

    pub fn add_elements(table: &TableRef, set: &str, elements: &[String]) -> Self {
        let block = element_block(elements);
        Self::new([
            "add",
            "element",
            table.family.as_str(),
            table.name.as_str(),
            set,
            block.as_str(),
        ])
    }

    pub fn delete_elements(table: &TableRef, set: &str, elements: &[String]) -> Self {
        let block = element_block(elements);
        Self::new([
            "delete",
            "element",
            table.family.as_str(),
            table.name.as_str(),
            set,
            block.as_str(),
        ])
    }

    pub fn add_counter(table: &TableRef, name: &str) -> Self {
        Self::new(["add", "counter", table.family.as_str(), table.name.as_str(), name])
    }

    pub fn list_ruleset(handles: bool) -> Self {
        with_handles(handles, Self::new(["list", "ruleset"]))
    }

    pub fn list_tables() -> Self {
        Self::new(["list", "tables"])
    }

    /// JSON table listing, used for status collection
    pub fn list_tables_json() -> Self {
        Self::new(["-j", "list", "tables"])
    }

    pub fn list_table(table: &TableRef, handles: bool) -> Self {
        with_handles(
            handles,
            Self::new(["list", "table", table.family.as_str(), table.name.as_str()]),
        )
    }

    pub fn list_chain(chain: &Target, handles: bool) -> Self {
        with_handles(
            handles,
            Self::new(["list", "chain", chain.family.as_str(), chain.table.as_str(), chain.chain.as_str()]),
        )
    }

    /// JSON chain listing with handles, the input of delete-by-predicate
    pub fn list_chain_json(chain: &Target) -> Self {
        Self::new([
            "-a",
            "-j",
            "list",
            "chain",
            chain.family.as_str(),
            chain.table.as_str(),
            chain.chain.as_str(),
        ])
    }

    pub fn list_set(table: &TableRef, name: &str) -> Self {
        Self::new(["list", "set", table.family.as_str(), table.name.as_str(), name])
    }

    /// Bulk load of a declarative ruleset through stdin
    pub fn load(ruleset: impl Into<String>) -> Self {
        Self {
            args: vec!["-f".to_string(), "-".to_string()],
            stdin: Some(ruleset.into()),
        }
    }

    pub fn version() -> Self {
        Self::new(["--version"])
    }
}

impl fmt::Display for NftCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nft {}", self.args.join(" "))?;
        if self.stdin.is_some() {
            write!(f, " < ruleset")?;
        }
        Ok(())
    }
}

fn with_handles(handles: bool, mut cmd: NftCommand) -> NftCommand {
    if handles {
        cmd.args.insert(0, "-a".to_string());
    }
    cmd
}

fn element_block(elements: &[String]) -> String {
    format!("{{ {} }}", elements.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nw_core::Family;

    #[test]
    fn nat_chain_keeps_hook_body_in_one_argument() {
        let chain = Target::new(Family::Ip, "nat", "prerouting");
        let cmd = NftCommand::add_chain(&chain, Some(&HookSpec::nat_prerouting()));
        assert_eq!(
            cmd.args,
            vec![
                "add",
                "chain",
                "ip",
                "nat",
                "prerouting",
                "{ type nat hook prerouting priority -100 ; }"
            ]
        );
    }

    #[test]
    fn insert_rule_uses_insert_verb() {
        let chain = Target::default();
        let statement = vec!["ip".into(), "saddr".into(), "1.2.3.4".into(), "accept".into()];
        let cmd = NftCommand::rule(&chain, Position::Insert, &statement);
        assert_eq!(
            cmd.to_string(),
            "nft insert rule inet filter input ip saddr 1.2.3.4 accept"
        );
    }

    #[test]
    fn set_creation_renders_flags() {
        let table = TableRef::new(Family::Inet, "filter");
        let cmd = NftCommand::create_set(&table, "blocked", "ipv4_addr", &["interval".into(), "timeout".into()]);
        assert_eq!(
            cmd.args.last().unwrap(),
            "{ type ipv4_addr ; flags interval,timeout ; }"
        );
    }

    #[test]
    fn handle_flag_precedes_verb() {
        let cmd = NftCommand::list_ruleset(true);
        assert_eq!(cmd.args, vec!["-a", "list", "ruleset"]);
    }

    #[test]
    fn load_reads_from_stdin() {
        let cmd = NftCommand::load("flush ruleset\n");
        assert_eq!(cmd.args, vec!["-f", "-"]);
        assert_eq!(cmd.to_string(), "nft -f - < ruleset");
    }
}
