use crate::error::FwError;
use crate::model::{Address, Direction, Family, HookSpec, Position, Protocol, TableRef, Target, Verdict};
use std::fmt;
use std::net::IpAddr;

const SET_FLAGS: &[&str] = &["constant", "interval", "timeout", "dynamic"];
const QUOTA_UNITS: &[&str] = &["bytes", "kbytes", "mbytes", "gbytes"];
const MAX_LOG_PREFIX: usize = 127;
const MAX_IFNAME: usize = 15;

/// High-level request the compiler turns into nft primitive operations
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    EnsureTable {
        table: TableRef,
    },
    EnsureChain {
        chain: Target,
        hook: Option<HookSpec>,
    },
    /// allow/block address, also used for the mirrored list rules
    FilterAddress {
        target: Target,
        address: Address,
        direction: Direction,
        verdict: Verdict,
        position: Position,
    },
    FilterPort {
        target: Target,
        port: u16,
        protocol: Protocol,
        verdict: Verdict,
    },
    PortForward {
        nat: TableRef,
        local_port: u16,
        remote_ip: IpAddr,
        remote_port: u16,
        protocol: Protocol,
    },
    Snat {
        nat: TableRef,
        source: Address,
        public_ip: IpAddr,
    },
    Dnat {
        nat: TableRef,
        public_port: u16,
        private_ip: IpAddr,
        private_port: u16,
        protocol: Protocol,
    },
    Masquerade {
        nat: TableRef,
        interface: Option<String>,
    },
    SetCreate {
        table: TableRef,
        name: String,
        element_type: String,
        flags: Vec<String>,
        elements: Vec<String>,
    },
    SetAdd {
        table: TableRef,
        name: String,
        elements: Vec<String>,
    },
    SetDelete {
        table: TableRef,
        name: String,
        elements: Vec<String>,
    },
    SetList {
        table: TableRef,
        name: String,
    },
    DeleteSet {
        table: TableRef,
        name: String,
    },
    MapCreate {
        table: TableRef,
        name: String,
        key_type: String,
        value_type: String,
    },
    EnableLog {
        target: Target,
        prefix: String,
        level: String,
    },
    CreateCounter {
        table: TableRef,
        name: String,
    },
    SetQuota {
        target: Target,
        quota: String,
    },
    /// Best-effort raw payload match; only meaningful for plaintext protocols with a fixed layout
    PayloadMatch {
        target: Target,
        pattern: String,
        port: u16,
        offset: u32,
        verdict: Verdict,
    },
    DeleteTable {
        table: TableRef,
    },
    DeleteChain {
        chain: Target,
    },
    DeleteRule {
        chain: Target,
        handle: u64,
    },
    FlushTable {
        table: TableRef,
    },
    FlushChain {
        chain: Target,
    },
    FlushRuleset,
    ListRuleset {
        handles: bool,
    },
    ListTables,
    ListTable {
        table: TableRef,
        handles: bool,
    },
    ListChain {
        chain: Target,
        handles: bool,
    },
}

impl Intent {
    pub fn allow_address(target: Target, address: Address) -> Self {
        Self::FilterAddress {
            target,
            address,
            direction: Direction::Source,
            verdict: Verdict::Accept,
            position: Position::Append,
        }
    }

    pub fn block_address(target: Target, address: Address) -> Self {
        Self::FilterAddress {
            target,
            address,
            direction: Direction::Source,
            verdict: Verdict::Drop,
            position: Position::Append,
        }
    }

    /// Short kebab-case name used in reports and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::EnsureTable { .. } => "ensure-table",
            Self::EnsureChain { .. } => "ensure-chain",
            Self::FilterAddress {
                verdict: Verdict::Accept,
                ..
            } => "allow-address",
            Self::FilterAddress { .. } => "block-address",
            Self::FilterPort {
                verdict: Verdict::Accept,
                ..
            } => "allow-port",
            Self::FilterPort { .. } => "block-port",
            Self::PortForward { .. } => "port-forward",
            Self::Snat { .. } => "snat",
            Self::Dnat { .. } => "dnat",
            Self::Masquerade { .. } => "masquerade",
            Self::SetCreate { .. } => "set-create",
            Self::SetAdd { .. } => "set-add",
            Self::SetDelete { .. } => "set-delete",
            Self::SetList { .. } => "set-list",
            Self::DeleteSet { .. } => "delete-set",
            Self::MapCreate { .. } => "map-create",
            Self::EnableLog { .. } => "enable-log",
            Self::CreateCounter { .. } => "create-counter",
            Self::SetQuota { .. } => "set-quota",
            Self::PayloadMatch { .. } => "payload-string-match",
            Self::DeleteTable { .. } => "delete-table",
            Self::DeleteChain { .. } => "delete-chain",
            Self::DeleteRule { .. } => "delete-rule",
            Self::FlushTable { .. } => "flush-table",
            Self::FlushChain { .. } => "flush-chain",
            Self::FlushRuleset => "flush-ruleset",
            Self::ListRuleset { .. } => "list-ruleset",
            Self::ListTables => "list-tables",
            Self::ListTable { .. } => "list-table",
            Self::ListChain { .. } => "list-chain",
        }
    }

    /// Check every required parameter before anything reaches nft
    pub fn validate(&self) -> Result<(), FwError> {
        let intent = self.name();

        match self {
            Self::EnsureTable { table }
            | Self::DeleteTable { table }
            | Self::FlushTable { table }
            | Self::ListTable { table, .. } => require_table(intent, table),
            Self::EnsureChain { chain, hook } => {
                require_target(intent, chain)?;
                if let Some(hook) = hook {
                    hook.validate(chain.family)?;
                }
                Ok(())
            }
            Self::DeleteChain { chain }
            | Self::FlushChain { chain }
            | Self::ListChain { chain, .. } => require_target(intent, chain),
            Self::DeleteRule { chain, handle } => {
                require_target(intent, chain)?;
                if *handle == 0 {
                    return Err(FwError::invalid(intent, "rule handle must be non-zero"));
                }
                Ok(())
            }
            Self::FilterAddress {
                target, address, ..
            } => {
                require_target(intent, target)?;
                require_address_family(intent, target.family, address)
            }
            Self::FilterPort { target, port, .. } => {
                require_target(intent, target)?;
                require_port(intent, "port", *port)
            }
            Self::PortForward {
                nat,
                local_port,
                remote_ip,
                remote_port,
                ..
            } => {
                require_table(intent, nat)?;
                require_port(intent, "local port", *local_port)?;
                require_port(intent, "remote port", *remote_port)?;
                require_address_family(intent, nat.family, &Address::from(*remote_ip))
            }
            Self::Snat {
                nat,
                source,
                public_ip,
            } => {
                require_table(intent, nat)?;
                require_address_family(intent, nat.family, source)?;
                require_address_family(intent, nat.family, &Address::from(*public_ip))?;
                if source.is_ipv4() != public_ip.is_ipv4() {
                    return Err(FwError::invalid(
                        intent,
                        "source network and public IP must share an address family",
                    ));
                }
                Ok(())
            }
            Self::Dnat {
                nat,
                public_port,
                private_ip,
                private_port,
                ..
            } => {
                require_table(intent, nat)?;
                require_port(intent, "public port", *public_port)?;
                require_port(intent, "private port", *private_port)?;
                require_address_family(intent, nat.family, &Address::from(*private_ip))
            }
            Self::Masquerade { nat, interface } => {
                require_table(intent, nat)?;
                if let Some(iface) = interface {
                    require_name(intent, "interface", iface)?;
                    if iface.len() > MAX_IFNAME {
                        return Err(FwError::invalid(
                            intent,
                            format!("interface name '{}' is longer than {} characters", iface, MAX_IFNAME),
                        ));
                    }
                }
                Ok(())
            }
            Self::SetCreate {
                table,
                name,
                element_type,
                flags,
                elements,
            } => {
                require_table(intent, table)?;
                require_name(intent, "set name", name)?;
                require_text(intent, "element type", element_type)?;
                for flag in flags {
                    if !SET_FLAGS.contains(&flag.as_str()) {
                        return Err(FwError::invalid(intent, format!("unknown set flag '{}'", flag)));
                    }
                }
                require_elements(intent, elements, false)
            }
            Self::SetAdd {
                table,
                name,
                elements,
            }
            | Self::SetDelete {
                table,
                name,
                elements,
            } => {
                require_table(intent, table)?;
                require_name(intent, "set name", name)?;
                require_elements(intent, elements, true)
            }
            Self::SetList { table, name } | Self::DeleteSet { table, name } => {
                require_table(intent, table)?;
                require_name(intent, "set name", name)
            }
            Self::MapCreate {
                table,
                name,
                key_type,
                value_type,
            } => {
                require_table(intent, table)?;
                require_name(intent, "map name", name)?;
                require_text(intent, "key type", key_type)?;
                require_text(intent, "value type", value_type)
            }
            Self::EnableLog {
                target,
                prefix,
                level,
            } => {
                require_target(intent, target)?;
                require_text(intent, "prefix", prefix)?;
                if prefix.len() > MAX_LOG_PREFIX {
                    return Err(FwError::invalid(
                        intent,
                        format!("prefix is longer than {} characters", MAX_LOG_PREFIX),
                    ));
                }
                require_name(intent, "log level", level)
            }
            Self::CreateCounter { table, name } => {
                require_table(intent, table)?;
                require_name(intent, "counter name", name)
            }
            Self::SetQuota { target, quota } => {
                require_target(intent, target)?;
                normalize_quota(quota).map(|_| ())
            }
            Self::PayloadMatch {
                target,
                pattern,
                port,
                ..
            } => {
                require_target(intent, target)?;
                if pattern.is_empty() {
                    return Err(FwError::invalid(intent, "match string is empty"));
                }
                require_port(intent, "port", *port)
            }
            Self::FlushRuleset | Self::ListRuleset { .. } | Self::ListTables => Ok(()),
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnsureTable { table } => write!(f, "ensure table {}", table),
            Self::EnsureChain { chain, .. } => write!(f, "ensure chain {}", chain),
            Self::FilterAddress {
                target,
                address,
                verdict,
                ..
            } => write!(f, "{} {} in {}", verdict, address, target),
            Self::FilterPort {
                target,
                port,
                protocol,
                verdict,
            } => write!(f, "{} {}/{} in {}", verdict, port, protocol, target),
            Self::PortForward {
                local_port,
                remote_ip,
                remote_port,
                protocol,
                ..
            } => write!(
                f,
                "forward {}/{} -> {}:{}",
                local_port, protocol, remote_ip, remote_port
            ),
            Self::Snat {
                source, public_ip, ..
            } => write!(f, "snat {} -> {}", source, public_ip),
            Self::Dnat {
                public_port,
                private_ip,
                private_port,
                protocol,
                ..
            } => write!(
                f,
                "dnat {}/{} -> {}:{}",
                public_port, protocol, private_ip, private_port
            ),
            Self::Masquerade { interface, .. } => match interface {
                Some(iface) => write!(f, "masquerade via {}", iface),
                None => write!(f, "masquerade"),
            },
            Self::SetCreate { table, name, .. } => write!(f, "create set {} {}", table, name),
            Self::SetAdd { table, name, elements } => {
                write!(f, "add {} element(s) to set {} {}", elements.len(), table, name)
            }
            Self::SetDelete { table, name, elements } => write!(
                f,
                "delete {} element(s) from set {} {}",
                elements.len(),
                table,
                name
            ),
            Self::SetList { table, name } => write!(f, "list set {} {}", table, name),
            Self::DeleteSet { table, name } => write!(f, "delete set {} {}", table, name),
            Self::MapCreate { table, name, .. } => write!(f, "create map {} {}", table, name),
            Self::EnableLog { target, prefix, .. } => {
                write!(f, "log '{}' in {}", prefix, target)
            }
            Self::CreateCounter { table, name } => write!(f, "create counter {} {}", table, name),
            Self::SetQuota { target, quota } => write!(f, "quota {} in {}", quota, target),
            Self::PayloadMatch {
                target,
                pattern,
                port,
                verdict,
                ..
            } => write!(f, "{} payload '{}' on port {} in {}", verdict, pattern, port, target),
            Self::DeleteTable { table } => write!(f, "delete table {}", table),
            Self::DeleteChain { chain } => write!(f, "delete chain {}", chain),
            Self::DeleteRule { chain, handle } => write!(f, "delete rule {} handle {}", chain, handle),
            Self::FlushTable { table } => write!(f, "flush table {}", table),
            Self::FlushChain { chain } => write!(f, "flush chain {}", chain),
            Self::FlushRuleset => write!(f, "flush ruleset"),
            Self::ListRuleset { .. } => write!(f, "list ruleset"),
            Self::ListTables => write!(f, "list tables"),
            Self::ListTable { table, .. } => write!(f, "list table {}", table),
            Self::ListChain { chain, .. } => write!(f, "list chain {}", chain),
        }
    }
}

/// Validate a quota expression and return it as `<amount> <unit>`
pub fn normalize_quota(quota: &str) -> Result<String, FwError> {
    let trimmed = quota.trim();
    if trimmed.is_empty() {
        return Err(FwError::invalid("set-quota", "quota expression is empty"));
    }

    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (amount, unit) = trimmed.split_at(split);
    let unit = unit.trim().to_ascii_lowercase();

    let amount: u64 = amount
        .parse()
        .map_err(|_| FwError::invalid("set-quota", format!("'{}' has no numeric amount", trimmed)))?;
    if amount == 0 {
        return Err(FwError::invalid("set-quota", "quota amount must be positive"));
    }
    if !QUOTA_UNITS.contains(&unit.as_str()) {
        return Err(FwError::invalid(
            "set-quota",
            format!("unknown unit '{}', expected one of {}", unit, QUOTA_UNITS.join(", ")),
        ));
    }

    Ok(format!("{} {}", amount, unit))
}

fn require_name(intent: &'static str, what: &str, value: &str) -> Result<(), FwError> {
    if value.trim().is_empty() {
        return Err(FwError::invalid(intent, format!("{} is empty", what)));
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '{' | '}' | ';' | '#' | '\\'))
    {
        return Err(FwError::invalid(
            intent,
            format!("{} '{}' contains characters nft cannot take", what, value),
        ));
    }
    Ok(())
}

/// Free text (prefixes, types); spaces allowed, statement delimiters are not
fn require_text(intent: &'static str, what: &str, value: &str) -> Result<(), FwError> {
    if value.trim().is_empty() {
        return Err(FwError::invalid(intent, format!("{} is empty", what)));
    }
    if value.chars().any(|c| matches!(c, '"' | '{' | '}' | ';' | '\\' | '\n')) {
        return Err(FwError::invalid(
            intent,
            format!("{} '{}' contains characters nft cannot take", what, value),
        ));
    }
    Ok(())
}

fn require_table(intent: &'static str, table: &TableRef) -> Result<(), FwError> {
    require_name(intent, "table name", &table.name)
}

fn require_target(intent: &'static str, target: &Target) -> Result<(), FwError> {
    require_name(intent, "table name", &target.table)?;
    require_name(intent, "chain name", &target.chain)
}

fn require_port(intent: &'static str, what: &str, port: u16) -> Result<(), FwError> {
    if port == 0 {
        return Err(FwError::invalid(intent, format!("{} must be between 1 and 65535", what)));
    }
    Ok(())
}

fn require_address_family(intent: &'static str, family: Family, address: &Address) -> Result<(), FwError> {
    if !family.accepts_address(address) {
        return Err(FwError::invalid(
            intent,
            format!("address {} cannot be matched in a {} table", address, family),
        ));
    }
    Ok(())
}

fn require_elements(intent: &'static str, elements: &[String], non_empty: bool) -> Result<(), FwError> {
    if non_empty && elements.is_empty() {
        return Err(FwError::invalid(intent, "no elements given"));
    }
    for element in elements {
        require_text(intent, "element", element)?;
        if element.contains(',') {
            return Err(FwError::invalid(
                intent,
                format!("element '{}' must be passed separately, not comma-joined", element),
            ));
        }
    }
    Ok(())
}
