use crate::error::FwError;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// nftables address family of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Ip,
    Ip6,
    #[default]
    Inet,
    Arp,
    Bridge,
    Netdev,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Ip6 => "ip6",
            Self::Inet => "inet",
            Self::Arp => "arp",
            Self::Bridge => "bridge",
            Self::Netdev => "netdev",
        }
    }

    /// Hooks a base chain of this family may attach to
    pub fn supports_hook(&self, hook: Hook) -> bool {
        match self {
            Self::Ip | Self::Ip6 | Self::Inet | Self::Bridge => true,
            Self::Arp => matches!(hook, Hook::Input | Hook::Output),
            // netdev only knows ingress/egress, which are not modelled here
            Self::Netdev => false,
        }
    }

    pub fn supports_chain_type(&self, chain_type: ChainType) -> bool {
        match chain_type {
            ChainType::Filter => true,
            ChainType::Nat => matches!(self, Self::Ip | Self::Ip6 | Self::Inet),
            ChainType::Route => matches!(self, Self::Ip | Self::Ip6 | Self::Inet),
        }
    }

    /// Whether `ip`/`ip6` address matchers are meaningful for this address
    pub fn accepts_address(&self, address: &Address) -> bool {
        match self {
            Self::Ip => address.is_ipv4(),
            Self::Ip6 => !address.is_ipv4(),
            Self::Inet | Self::Bridge | Self::Netdev => true,
            Self::Arp => false,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = FwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ip" => Ok(Self::Ip),
            "ip6" => Ok(Self::Ip6),
            "inet" => Ok(Self::Inet),
            "arp" => Ok(Self::Arp),
            "bridge" => Ok(Self::Bridge),
            "netdev" => Ok(Self::Netdev),
            other => Err(FwError::invalid("family", format!("unknown family '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainType {
    Filter,
    Nat,
    Route,
}

impl ChainType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Nat => "nat",
            Self::Route => "route",
        }
    }
}

impl FromStr for ChainType {
    type Err = FwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "filter" => Ok(Self::Filter),
            "nat" => Ok(Self::Nat),
            "route" => Ok(Self::Route),
            other => Err(FwError::invalid("chain type", format!("unknown chain type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hook {
    Input,
    Output,
    Forward,
    Prerouting,
    Postrouting,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Forward => "forward",
            Self::Prerouting => "prerouting",
            Self::Postrouting => "postrouting",
        }
    }
}

impl FromStr for Hook {
    type Err = FwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "input" => Ok(Self::Input),
            "output" => Ok(Self::Output),
            "forward" => Ok(Self::Forward),
            "prerouting" => Ok(Self::Prerouting),
            "postrouting" => Ok(Self::Postrouting),
            other => Err(FwError::invalid("hook", format!("unknown hook '{}'", other))),
        }
    }
}

/// Hook specification that turns a chain into a base chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    pub chain_type: ChainType,
    pub hook: Hook,
    pub priority: i32,
}

impl HookSpec {
    pub fn new(chain_type: ChainType, hook: Hook, priority: i32) -> Self {
        Self {
            chain_type,
            hook,
            priority,
        }
    }

    pub fn nat_prerouting() -> Self {
        Self::new(ChainType::Nat, Hook::Prerouting, -100)
    }

    pub fn nat_postrouting() -> Self {
        Self::new(ChainType::Nat, Hook::Postrouting, 100)
    }

    /// Filter chains named after a standard hook are created as base chains
    pub fn default_for_chain(name: &str) -> Option<Self> {
        match name {
            "input" => Some(Self::new(ChainType::Filter, Hook::Input, 0)),
            "output" => Some(Self::new(ChainType::Filter, Hook::Output, 0)),
            "forward" => Some(Self::new(ChainType::Filter, Hook::Forward, 0)),
            _ => None,
        }
    }

    pub fn validate(&self, family: Family) -> Result<(), FwError> {
        if !family.supports_hook(self.hook) {
            return Err(FwError::invalid(
                "ensure-chain",
                format!("family {} has no {} hook", family, self.hook.as_str()),
            ));
        }
        if !family.supports_chain_type(self.chain_type) {
            return Err(FwError::invalid(
                "ensure-chain",
                format!("family {} has no {} chains", family, self.chain_type.as_str()),
            ));
        }
        if self.chain_type == ChainType::Nat
            && !matches!(self.hook, Hook::Prerouting | Hook::Postrouting | Hook::Input | Hook::Output)
        {
            return Err(FwError::invalid(
                "ensure-chain",
                format!("nat chains cannot attach to the {} hook", self.hook.as_str()),
            ));
        }
        Ok(())
    }

    /// Chain body as nft expects it, e.g. `{ type nat hook prerouting priority -100 ; }`
    pub fn render(&self) -> String {
        format!(
            "{{ type {} hook {} priority {} ; }}",
            self.chain_type.as_str(),
            self.hook.as_str(),
            self.priority
        )
    }
}

/// Terminal verdict used by filter intents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Drop,
    Reject,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = FwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "drop" => Ok(Self::Drop),
            "reject" => Ok(Self::Reject),
            other => Err(FwError::invalid("verdict", format!("unknown verdict '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = FwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(FwError::invalid("protocol", format!("unsupported protocol '{}'", other))),
        }
    }
}

/// Which side of the packet an address matcher looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Source,
    Destination,
}

impl Direction {
    pub fn field(&self) -> &'static str {
        match self {
            Self::Source => "saddr",
            Self::Destination => "daddr",
        }
    }
}

/// Where a new rule lands in its chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    #[default]
    Append,
    /// Head of the chain, evaluated before every appended rule
    Insert,
}

/// Single host or CIDR network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(IpNet);

impl Address {
    pub fn is_ipv4(&self) -> bool {
        matches!(self.0, IpNet::V4(_))
    }

    pub fn is_host(&self) -> bool {
        self.0.prefix_len() == self.0.max_prefix_len()
    }

    /// Matcher protocol keyword (`ip` or `ip6`)
    pub fn protocol(&self) -> &'static str {
        if self.is_ipv4() { "ip" } else { "ip6" }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Self(IpNet::from(ip))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            write!(f, "{}", self.0.addr())
        } else {
            write!(f, "{}/{}", self.0.network(), self.0.prefix_len())
        }
    }
}

impl FromStr for Address {
    type Err = FwError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(FwError::invalid("address", "address is empty"));
        }
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Ok(Self::from(ip));
        }
        trimmed
            .parse::<IpNet>()
            .map(Self)
            .map_err(|_| FwError::invalid("address", format!("'{}' is not an IP address or CIDR", trimmed)))
    }
}

/// (family, table) pair identifying a table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub family: Family,
    pub name: String,
}

impl TableRef {
    pub fn new(family: Family, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }

    pub fn chain(&self, chain: impl Into<String>) -> Target {
        Target::new(self.family, self.name.clone(), chain)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.name)
    }
}

/// (family, table, chain) triple a rule is written into
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub family: Family,
    pub table: String,
    pub chain: String,
}

impl Target {
    pub fn new(family: Family, table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            family,
            table: table.into(),
            chain: chain.into(),
        }
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.family, self.table.clone())
    }

    pub fn with_chain(&self, chain: impl Into<String>) -> Self {
        Self::new(self.family, self.table.clone(), chain)
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new(Family::Inet, "filter", "input")
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.family, self.table, self.chain)
    }
}
