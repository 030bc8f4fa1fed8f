//! In-memory stand-ins for nft and the host, for tests here and in dependent crates.
//!
//! `FakeNft` keeps tables, chains, rules with handles and sets, and mirrors
//! the nft behaviours the applier relies on: `add` is idempotent, `create`
//! refuses existing objects, `insert` lands at the head of a chain and
//! `-a -j list chain` reports rules as JSON with handles.

use crate::command::NftCommand;
use crate::engine::NftEngine;
use crate::host::Host;
use nw_core::{FwError, TableRef, Target};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const NO_SUCH_OBJECT: &str = "Error: Could not process rule: No such file or directory";
const OBJECT_EXISTS: &str = "Error: Could not process rule: File exists";
const CHAIN_BUSY: &str = "Error: Could not process rule: Device or resource busy";

type ObjectKey = (String, String, String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRule {
    pub handle: u64,
    pub text: String,
}

#[derive(Debug, Default, Clone)]
struct FakeChain {
    hook: Option<String>,
    rules: Vec<FakeRule>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeSet<(String, String)>,
    chains: BTreeMap<ObjectKey, FakeChain>,
    sets: BTreeMap<ObjectKey, Vec<String>>,
    counters: BTreeSet<ObjectKey>,
    next_handle: u64,
    loaded: Vec<String>,
}

/// Stateful nft stand-in
pub struct FakeNft {
    state: Mutex<State>,
    log: Mutex<Vec<NftCommand>>,
    failures: Mutex<Vec<(String, String)>>,
    installed: Arc<AtomicBool>,
}

impl FakeNft {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            log: Mutex::new(vec![]),
            failures: Mutex::new(vec![]),
            installed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// An engine whose binary is absent until a `FakeHost` installs it
    pub fn uninstalled() -> Self {
        let fake = Self::new();
        fake.installed.store(false, Ordering::SeqCst);
        fake
    }

    /// Reject every command whose rendering contains `pattern`
    pub fn fail_on(&self, pattern: &str, stderr: &str) {
        lock(&self.failures).push((pattern.to_string(), stderr.to_string()));
    }

    /// Rendered commands seen so far
    pub fn commands(&self) -> Vec<String> {
        lock(&self.log).iter().map(ToString::to_string).collect()
    }

    pub fn has_table(&self, table: &TableRef) -> bool {
        lock(&self.state)
            .tables
            .contains(&(table.family.to_string(), table.name.clone()))
    }

    pub fn has_chain(&self, chain: &Target) -> bool {
        lock(&self.state).chains.contains_key(&chain_key(chain))
    }

    /// Rule texts of a chain, head first
    pub fn rules(&self, chain: &Target) -> Vec<String> {
        lock(&self.state)
            .chains
            .get(&chain_key(chain))
            .map(|c| c.rules.iter().map(|r| r.text.clone()).collect())
            .unwrap_or_default()
    }

    pub fn set_elements(&self, table: &TableRef, name: &str) -> Option<Vec<String>> {
        lock(&self.state)
            .sets
            .get(&(table.family.to_string(), table.name.clone(), name.to_string()))
            .cloned()
    }

    /// Rulesets fed through `nft -f -`
    pub fn loaded(&self) -> Vec<String> {
        lock(&self.state).loaded.clone()
    }
}

impl Default for FakeNft {
    fn default() -> Self {
        Self::new()
    }
}

impl NftEngine for FakeNft {
    async fn available(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    async fn execute(&self, command: &NftCommand) -> Result<String, FwError> {
        lock(&self.log).push(command.clone());

        if !self.installed.load(Ordering::SeqCst) {
            return Err(FwError::PrerequisiteMissing("nft is not installed".to_string()));
        }

        let rendered = command.to_string();
        let injected = lock(&self.failures)
            .iter()
            .find(|(pattern, _)| rendered.contains(pattern.as_str()))
            .map(|(_, stderr)| stderr.clone());
        if let Some(stderr) = injected {
            return Err(rejected(command, stderr));
        }

        lock(&self.state)
            .apply(command)
            .map_err(|stderr| rejected(command, stderr.to_string()))
    }
}

impl State {
    fn apply(&mut self, command: &NftCommand) -> Result<String, String> {
        let mut handles = false;
        let mut json = false;
        let mut rest: Vec<&str> = vec![];
        for arg in &command.args {
            match arg.as_str() {
                "-a" => handles = true,
                "-j" => json = true,
                other => rest.push(other),
            }
        }

        match rest.as_slice() {
            ["--version"] => Ok("nftables v1.0.9 (Old Doc Yak #3)\n".to_string()),
            ["-f", "-"] => {
                self.loaded.push(command.stdin.clone().unwrap_or_default());
                Ok(String::new())
            }
            ["add", "table", family, table] => {
                self.tables.insert((family.to_string(), table.to_string()));
                Ok(String::new())
            }
            ["delete", "table", family, table] => {
                let key = (family.to_string(), table.to_string());
                if !self.tables.remove(&key) {
                    return Err(NO_SUCH_OBJECT.to_string());
                }
                let outside = |k: &ObjectKey| k.0 != key.0 || k.1 != key.1;
                self.chains.retain(|k, _| outside(k));
                self.sets.retain(|k, _| outside(k));
                self.counters.retain(outside);
                Ok(String::new())
            }
            ["flush", "table", family, table] => {
                self.require_table(family, table)?;
                for (key, chain) in self.chains.iter_mut() {
                    if key.0 == *family && key.1 == *table {
                        chain.rules.clear();
                    }
                }
                Ok(String::new())
            }
            ["add", "chain", family, table, name, hook @ ..] => {
                self.require_table(family, table)?;
                let chain = self
                    .chains
                    .entry(key(family, table, name))
                    .or_insert_with(FakeChain::default);
                if chain.hook.is_none() {
                    chain.hook = hook.first().map(|h| h.to_string());
                }
                Ok(String::new())
            }
            ["delete", "chain", family, table, name] => {
                let key = key(family, table, name);
                match self.chains.get(&key) {
                    None => Err(NO_SUCH_OBJECT.to_string()),
                    Some(chain) if !chain.rules.is_empty() => Err(CHAIN_BUSY.to_string()),
                    Some(_) => {
                        self.chains.remove(&key);
                        Ok(String::new())
                    }
                }
            }
            ["flush", "chain", family, table, name] => {
                self.chain_mut(family, table, name)?.rules.clear();
                Ok(String::new())
            }
            ["flush", "ruleset"] => {
                self.tables.clear();
                self.chains.clear();
                self.sets.clear();
                self.counters.clear();
                Ok(String::new())
            }
            [verb @ ("add" | "insert"), "rule", family, table, name, statement @ ..] => {
                if statement.is_empty() {
                    return Err("Error: syntax error, unexpected end of file".to_string());
                }
                let handle = self.next_handle();
                let chain = self.chain_mut(family, table, name)?;
                let rule = FakeRule {
                    handle,
                    text: statement.join(" "),
                };
                if *verb == "insert" {
                    chain.rules.insert(0, rule);
                } else {
                    chain.rules.push(rule);
                }
                Ok(String::new())
            }
            ["delete", "rule", family, table, name, "handle", handle] => {
                let handle: u64 = handle.parse().map_err(|_| NO_SUCH_OBJECT.to_string())?;
                let chain = self.chain_mut(family, table, name)?;
                let before = chain.rules.len();
                chain.rules.retain(|r| r.handle != handle);
                if chain.rules.len() == before {
                    return Err(NO_SUCH_OBJECT.to_string());
                }
                Ok(String::new())
            }
            ["create", "set" | "map", family, table, name, _body] => {
                self.require_table(family, table)?;
                let key = key(family, table, name);
                if self.sets.contains_key(&key) {
                    return Err(OBJECT_EXISTS.to_string());
                }
                self.sets.insert(key, vec![]);
                Ok(String::new())
            }
            ["delete", "set", family, table, name] => {
                self.sets
                    .remove(&key(family, table, name))
                    .map(|_| String::new())
                    .ok_or_else(|| NO_SUCH_OBJECT.to_string())
            }
            ["add", "element", family, table, name, block] => {
                let set = self
                    .sets
                    .get_mut(&key(family, table, name))
                    .ok_or_else(|| NO_SUCH_OBJECT.to_string())?;
                for element in parse_block(block) {
                    if !set.contains(&element) {
                        set.push(element);
                    }
                }
                Ok(String::new())
            }
            ["delete", "element", family, table, name, block] => {
                let set = self
                    .sets
                    .get_mut(&key(family, table, name))
                    .ok_or_else(|| NO_SUCH_OBJECT.to_string())?;
                let elements = parse_block(block);
                if elements.iter().any(|e| !set.contains(e)) {
                    return Err(NO_SUCH_OBJECT.to_string());
                }
                set.retain(|e| !elements.contains(e));
                Ok(String::new())
            }
            ["add", "counter", family, table, name] => {
                self.require_table(family, table)?;
                self.counters.insert(key(family, table, name));
                Ok(String::new())
            }
            ["list", "ruleset"] => Ok(self
                .tables
                .iter()
                .map(|(f, t)| self.render_table(f, t, handles))
                .collect()),
            ["list", "tables"] if json => {
                let mut items = vec![metainfo()];
                for (family, name) in &self.tables {
                    items.push(json!({"table": {"family": family, "name": name, "handle": 1}}));
                }
                Ok(json!({ "nftables": items }).to_string())
            }
            ["list", "tables"] => Ok(self
                .tables
                .iter()
                .map(|(f, t)| format!("table {} {}\n", f, t))
                .collect()),
            ["list", "table", family, table] if json => {
                self.require_table(family, table)?;
                let mut items = vec![
                    metainfo(),
                    json!({"table": {"family": family, "name": table}}),
                ];
                for ((f, t, name), chain) in &self.chains {
                    if f != family || t != table {
                        continue;
                    }
                    items.push(json!({"chain": {"family": f, "table": t, "name": name}}));
                    for rule in &chain.rules {
                        items.push(json!({"rule": {
                            "family": f,
                            "table": t,
                            "chain": name,
                            "handle": rule.handle,
                            "expr": rule_exprs(&rule.text),
                        }}));
                    }
                }
                Ok(json!({ "nftables": items }).to_string())
            }
            ["list", "table", family, table] => {
                self.require_table(family, table)?;
                Ok(self.render_table(family, table, handles))
            }
            ["list", "chain", family, table, name] if json => {
                let chain = self
                    .chains
                    .get(&key(family, table, name))
                    .ok_or_else(|| NO_SUCH_OBJECT.to_string())?;
                let mut items = vec![
                    metainfo(),
                    json!({"chain": {"family": family, "table": table, "name": name}}),
                ];
                for rule in &chain.rules {
                    items.push(json!({"rule": {
                        "family": family,
                        "table": table,
                        "chain": name,
                        "handle": rule.handle,
                        "expr": rule_exprs(&rule.text),
                    }}));
                }
                Ok(json!({ "nftables": items }).to_string())
            }
            ["list", "chain", family, table, name] => {
                let chain = self
                    .chains
                    .get(&key(family, table, name))
                    .ok_or_else(|| NO_SUCH_OBJECT.to_string())?;
                Ok(format!(
                    "table {} {} {{\n{}}}\n",
                    family,
                    table,
                    render_chain(name, chain, handles)
                ))
            }
            ["list", "set", family, table, name] => {
                let set = self
                    .sets
                    .get(&key(family, table, name))
                    .ok_or_else(|| NO_SUCH_OBJECT.to_string())?;
                Ok(format!(
                    "table {} {} {{\n{}}}\n",
                    family,
                    table,
                    render_set(name, set)
                ))
            }
            other => Err(format!(
                "Error: syntax error, unexpected {}",
                other.join(" ")
            )),
        }
    }

    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn require_table(&self, family: &str, table: &str) -> Result<(), String> {
        if self.tables.contains(&(family.to_string(), table.to_string())) {
            Ok(())
        } else {
            Err(NO_SUCH_OBJECT.to_string())
        }
    }

    fn chain_mut(&mut self, family: &str, table: &str, name: &str) -> Result<&mut FakeChain, String> {
        self.chains
            .get_mut(&key(family, table, name))
            .ok_or_else(|| NO_SUCH_OBJECT.to_string())
    }

    fn render_table(&self, family: &str, table: &str, handles: bool) -> String {
        let mut out = format!("table {} {} {{\n", family, table);
        for ((f, t, name), chain) in &self.chains {
            if f == family && t == table {
                out.push_str(&render_chain(name, chain, handles));
            }
        }
        for ((f, t, name), set) in &self.sets {
            if f == family && t == table {
                out.push_str(&render_set(name, set));
            }
        }
        for (f, t, name) in &self.counters {
            if f == family && t == table {
                out.push_str(&format!("\tcounter {} {{\n\t\tpackets 0 bytes 0\n\t}}\n", name));
            }
        }
        out.push_str("}\n");
        out
    }
}

/// Host stand-in recording side effects
pub struct FakeHost {
    forwarding: AtomicBool,
    installs: AtomicUsize,
    install_error: Option<String>,
    engine: Option<Arc<AtomicBool>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            forwarding: AtomicBool::new(false),
            installs: AtomicUsize::new(0),
            install_error: None,
            engine: None,
        }
    }

    /// A host whose package install makes `engine` available
    pub fn installing(engine: &FakeNft) -> Self {
        Self {
            engine: Some(engine.installed.clone()),
            ..Self::new()
        }
    }

    /// A host where installing nftables fails
    pub fn without_package_manager() -> Self {
        Self {
            install_error: Some("no supported package manager was found".to_string()),
            ..Self::new()
        }
    }

    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn forwarding(&self) -> bool {
        self.forwarding.load(Ordering::SeqCst)
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for FakeHost {
    async fn install_engine(&self) -> Result<(), FwError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.install_error {
            return Err(FwError::PrerequisiteMissing(reason.clone()));
        }
        if let Some(flag) = &self.engine {
            flag.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn enable_ip_forwarding(&self) -> Result<(), FwError> {
        self.forwarding.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ip_forwarding_enabled(&self) -> Result<bool, FwError> {
        Ok(self.forwarding())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn rejected(command: &NftCommand, stderr: String) -> FwError {
    FwError::EngineRejected {
        command: command.to_string(),
        stderr,
        exit_code: Some(1),
    }
}

fn key(family: &str, table: &str, name: &str) -> ObjectKey {
    (family.to_string(), table.to_string(), name.to_string())
}

fn chain_key(chain: &Target) -> ObjectKey {
    key(chain.family.as_str(), &chain.table, &chain.chain)
}

fn metainfo() -> Value {
    json!({"metainfo": {"version": "1.0.9", "json_schema_version": 1}})
}

fn parse_block(block: &str) -> Vec<String> {
    block
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect()
}

fn render_chain(name: &str, chain: &FakeChain, handles: bool) -> String {
    let mut out = format!("\tchain {} {{\n", name);
    if let Some(hook) = &chain.hook {
        let body = hook.trim().trim_start_matches('{').trim_end_matches('}').trim();
        out.push_str(&format!("\t\t{}\n", body));
    }
    for rule in &chain.rules {
        if handles {
            out.push_str(&format!("\t\t{} # handle {}\n", rule.text, rule.handle));
        } else {
            out.push_str(&format!("\t\t{}\n", rule.text));
        }
    }
    out.push_str("\t}\n");
    out
}

fn render_set(name: &str, elements: &[String]) -> String {
    let mut out = format!("\tset {} {{\n", name);
    if !elements.is_empty() {
        out.push_str(&format!("\t\telements = {{ {} }}\n", elements.join(", ")));
    }
    out.push_str("\t}\n");
    out
}

/// The subset of nft's JSON expression schema the handle parser reads
fn rule_exprs(text: &str) -> Vec<Value> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut exprs = vec![];
    let mut i = 0;

    while i < tokens.len() {
        match tokens[i] {
            protocol @ ("ip" | "ip6" | "tcp" | "udp")
                if i + 2 < tokens.len()
                    && matches!(tokens[i + 1], "saddr" | "daddr" | "sport" | "dport") =>
            {
                exprs.push(json!({"match": {
                    "op": "==",
                    "left": {"payload": {"protocol": protocol, "field": tokens[i + 1]}},
                    "right": json_value(tokens[i + 2]),
                }}));
                i += 3;
            }
            statement @ ("dnat" | "snat") => {
                let target = tokens.last().copied().unwrap_or_default();
                exprs.push(keyed(statement, json!({ "addr": target })));
                break;
            }
            verdict @ ("accept" | "drop" | "reject" | "masquerade") => {
                exprs.push(keyed(verdict, Value::Null));
                i += 1;
            }
            "counter" => {
                exprs.push(json!({"counter": {"packets": 0, "bytes": 0}}));
                i += 1;
            }
            _ => i += 1,
        }
    }

    exprs
}

fn keyed(key: &str, value: Value) -> Value {
    let mut object = Map::new();
    object.insert(key.to_string(), value);
    Value::Object(object)
}

fn json_value(token: &str) -> Value {
    if let Ok(n) = token.parse::<u64>() {
        return json!(n);
    }
    if let Some((addr, len)) = token.split_once('/') {
        if let Ok(len) = len.parse::<u64>() {
            return json!({"prefix": {"addr": addr, "len": len}});
        }
    }
    json!(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nw_core::Family;

    #[tokio::test]
    async fn add_is_idempotent_and_create_is_not() {
        let nft = FakeNft::new();
        let table = TableRef::new(Family::Inet, "filter");

        nft.execute(&NftCommand::add_table(&table)).await.unwrap();
        nft.execute(&NftCommand::add_table(&table)).await.unwrap();
        assert!(nft.has_table(&table));

        let set = NftCommand::create_set(&table, "blocked", "ipv4_addr", &[]);
        nft.execute(&set).await.unwrap();
        let err = nft.execute(&set).await.unwrap_err();
        assert!(matches!(err, FwError::EngineRejected { .. }));
    }

    #[tokio::test]
    async fn insert_lands_at_head() {
        let nft = FakeNft::new();
        let chain = Target::default();
        nft.execute(&NftCommand::add_table(&chain.table_ref())).await.unwrap();
        nft.execute(&NftCommand::add_chain(&chain, None)).await.unwrap();

        let rule = |s: &str| s.split(' ').map(String::from).collect::<Vec<_>>();
        nft.execute(&NftCommand::rule(&chain, nw_core::Position::Append, &rule("tcp dport 22 drop")))
            .await
            .unwrap();
        nft.execute(&NftCommand::rule(&chain, nw_core::Position::Insert, &rule("ip saddr 10.0.0.1 accept")))
            .await
            .unwrap();

        assert_eq!(
            nft.rules(&chain),
            vec!["ip saddr 10.0.0.1 accept", "tcp dport 22 drop"]
        );
    }

    #[tokio::test]
    async fn json_listing_carries_handles_and_prefixes() {
        let nft = FakeNft::new();
        let chain = Target::default();
        nft.execute(&NftCommand::add_table(&chain.table_ref())).await.unwrap();
        nft.execute(&NftCommand::add_chain(&chain, None)).await.unwrap();
        let statement: Vec<String> = ["ip", "saddr", "10.0.0.0/8", "drop"].map(String::from).to_vec();
        nft.execute(&NftCommand::rule(&chain, nw_core::Position::Append, &statement))
            .await
            .unwrap();

        let out = nft.execute(&NftCommand::list_chain_json(&chain)).await.unwrap();
        let rules = crate::handles::parse_chain_listing(&out).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].matches[0].value, "10.0.0.0/8");
        assert_eq!(rules[0].verdict.as_deref(), Some("drop"));
    }

    #[tokio::test]
    async fn rules_need_an_existing_chain() {
        let nft = FakeNft::new();
        let statement = vec!["drop".to_string()];
        let err = nft
            .execute(&NftCommand::rule(&Target::default(), nw_core::Position::Append, &statement))
            .await
            .unwrap_err();
        match err {
            FwError::EngineRejected { stderr, .. } => assert!(stderr.contains("No such file")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
