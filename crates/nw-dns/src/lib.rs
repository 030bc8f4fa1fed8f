//! Name resolution for domain-based blocking.

use nw_core::{Address, ApplyReport, FwError, Intent, Target};
use nw_nft::{Applier, Host, NftEngine};
use std::net::{IpAddr, Ipv4Addr};
use tokio::process::Command;
use tracing::{debug, info};

/// Source of addresses for a host name
#[allow(async_fn_in_trait)]
pub trait Resolver {
    /// Every address the name resolves to, in resolver order. Failure to
    /// resolve yields an empty list.
    async fn lookup(&self, name: &str) -> Vec<IpAddr>;
}

/// The system resolver, falling back to the `host` tool
pub struct SystemResolver;

impl SystemResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for SystemResolver {
    async fn lookup(&self, name: &str) -> Vec<IpAddr> {
        // lookup_host needs a port
        match tokio::net::lookup_host((name, 0u16)).await {
            Ok(addrs) => addrs.map(|a| a.ip()).collect(),
            Err(e) => {
                debug!(name, error = %e, "system lookup failed, trying host");
                lookup_with_host_command(name).await
            }
        }
    }
}

async fn lookup_with_host_command(name: &str) -> Vec<IpAddr> {
    let Ok(output) = Command::new("host").arg(name).output().await else {
        return vec![];
    };
    if !output.status.success() {
        return vec![];
    }

    parse_host_output(&String::from_utf8_lossy(&output.stdout))
}

/// "example.com has address 93.184.216.34"
fn parse_host_output(stdout: &str) -> Vec<IpAddr> {
    stdout
        .lines()
        .filter(|line| line.contains("has address") || line.contains("has IPv6 address"))
        .filter_map(|line| line.split_whitespace().last())
        .filter_map(|addr| addr.parse().ok())
        .collect()
}

/// IPv4 addresses of `name`, deduplicated, in resolver order
pub async fn resolve_detection_ips(
    resolver: &impl Resolver,
    name: &str,
) -> Result<Vec<Ipv4Addr>, FwError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(FwError::invalid("resolve-detection-ips", "a domain name is required"));
    }

    let mut unique: Vec<Ipv4Addr> = vec![];
    for addr in resolver.lookup(name).await {
        if let IpAddr::V4(v4) = addr {
            if !unique.contains(&v4) {
                unique.push(v4);
            }
        }
    }

    if unique.is_empty() {
        return Err(FwError::UnresolvableName(name.to_string()));
    }

    debug!(name, count = unique.len(), "resolved detection addresses");
    Ok(unique)
}

/// Resolve `name` and block every address in `target`, stopping at the first failure
pub async fn block_domain<E: NftEngine, H: Host>(
    applier: &Applier<E, H>,
    resolver: &impl Resolver,
    name: &str,
    target: &Target,
) -> Result<Vec<ApplyReport>, FwError> {
    let ips = resolve_detection_ips(resolver, name).await?;

    let mut reports = vec![];
    for ip in ips {
        let intent = Intent::block_address(target.clone(), Address::from(IpAddr::V4(ip)));
        reports.push(applier.apply(&intent).await?);
    }

    info!(name, blocked = reports.len(), "domain blocked");
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nw_nft::fake::{FakeHost, FakeNft};

    struct StaticResolver(Vec<IpAddr>);

    impl Resolver for StaticResolver {
        async fn lookup(&self, _name: &str) -> Vec<IpAddr> {
            self.0.clone()
        }
    }

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn keeps_ipv4_only_without_duplicates() {
        let resolver = StaticResolver(ips(&["93.184.216.34", "2606:2800::1", "93.184.216.35", "93.184.216.34"]));
        let found = resolve_detection_ips(&resolver, "example.test").await.unwrap();
        assert_eq!(
            found,
            vec![
                "93.184.216.34".parse::<Ipv4Addr>().unwrap(),
                "93.184.216.35".parse().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn empty_answer_is_unresolvable_and_engine_untouched() {
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let resolver = StaticResolver(vec![]);

        let err = block_domain(&applier, &resolver, "example.test", &Target::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FwError::UnresolvableName(ref n) if n == "example.test"));
        assert!(applier.engine().commands().is_empty());
    }

    #[tokio::test]
    async fn ipv6_only_answer_is_unresolvable() {
        let resolver = StaticResolver(ips(&["::1"]));
        let err = resolve_detection_ips(&resolver, "v6.example.test").await.unwrap_err();
        assert!(matches!(err, FwError::UnresolvableName(_)));
    }

    #[tokio::test]
    async fn block_domain_blocks_each_address() {
        let applier = Applier::new(FakeNft::new(), FakeHost::new());
        let resolver = StaticResolver(ips(&["192.0.2.10", "192.0.2.11"]));
        let target = Target::default();

        let reports = block_domain(&applier, &resolver, "ads.example.test", &target)
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(
            applier.engine().rules(&target),
            vec!["ip saddr 192.0.2.10 drop", "ip saddr 192.0.2.11 drop"]
        );
    }

    #[test]
    fn parses_host_tool_output() {
        let out = "example.com has address 93.184.216.34\n\
                   example.com has IPv6 address 2606:2800:220:1:248:1893:25c8:1946\n\
                   example.com mail is handled by 0 .\n";
        assert_eq!(parse_host_output(out).len(), 2);
    }
}
