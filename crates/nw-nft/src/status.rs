use crate::command::NftCommand;
use crate::engine::NftEngine;
use crate::handles::{count_table_objects, parse_table_listing};
use crate::host::Host;
use nw_core::FwError;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub family: String,
    pub name: String,
    pub chains: usize,
    pub rules: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub available: bool,
    pub version: Option<String>,
    /// `None` when the sysctl could not be read
    pub ip_forwarding: Option<bool>,
    pub tables: Vec<TableStatus>,
}

impl EngineStatus {
    pub fn display(&self) {
        println!("📊 Firewall Status\n");

        match (self.available, &self.version) {
            (true, Some(version)) => println!("🔥 nft: {}", version),
            (true, None) => println!("🔥 nft: available"),
            (false, _) => println!("❌ nft: not installed"),
        }

        match self.ip_forwarding {
            Some(true) => println!("↪️  IPv4 forwarding: enabled"),
            Some(false) => println!("↪️  IPv4 forwarding: disabled"),
            None => println!("↪️  IPv4 forwarding: unknown"),
        }

        println!("\n📋 Tables ({}):", self.tables.len());
        if self.tables.is_empty() {
            println!("  (none)");
        } else {
            for table in &self.tables {
                println!(
                    "  • {} {} ({} chains, {} rules)",
                    table.family, table.name, table.chains, table.rules
                );
            }
        }
    }
}

/// Gathers engine and host state without changing either
pub struct StatusCollector<'a, E, H> {
    engine: &'a E,
    host: &'a H,
}

impl<'a, E: NftEngine, H: Host> StatusCollector<'a, E, H> {
    pub fn new(engine: &'a E, host: &'a H) -> Self {
        Self { engine, host }
    }

    pub async fn collect(&self) -> Result<EngineStatus, FwError> {
        let ip_forwarding = self.host.ip_forwarding_enabled().await.ok();

        if !self.engine.available().await {
            return Ok(EngineStatus {
                available: false,
                version: None,
                ip_forwarding,
                tables: vec![],
            });
        }

        let version = self
            .engine
            .execute(&NftCommand::version())
            .await
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(EngineStatus {
            available: true,
            version,
            ip_forwarding,
            tables: self.collect_tables().await?,
        })
    }

    async fn collect_tables(&self) -> Result<Vec<TableStatus>, FwError> {
        let listing = self.engine.execute(&NftCommand::list_tables_json()).await?;

        let mut tables = vec![];
        for (family, name) in parse_table_listing(&listing)? {
            let cmd = NftCommand::new(["-j", "list", "table", family.as_str(), name.as_str()]);
            // a table dropped between the two listings counts as empty
            let (chains, rules) = match self.engine.execute(&cmd).await {
                Ok(contents) => count_table_objects(&contents)?,
                Err(_) => (0, 0),
            };
            tables.push(TableStatus {
                family,
                name,
                chains,
                rules,
            });
        }

        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeHost, FakeNft};
    use nw_core::{Position, TableRef, Target};

    #[tokio::test]
    async fn counts_chains_and_rules_per_table() {
        let nft = FakeNft::new();
        let host = FakeHost::new();
        let chain = Target::default();
        nft.execute(&NftCommand::add_table(&chain.table_ref())).await.unwrap();
        nft.execute(&NftCommand::add_chain(&chain, None)).await.unwrap();
        nft.execute(&NftCommand::rule(&chain, Position::Append, &["drop".to_string()]))
            .await
            .unwrap();
        nft.execute(&NftCommand::add_table(&TableRef::new(nw_core::Family::Ip, "nat")))
            .await
            .unwrap();

        let status = StatusCollector::new(&nft, &host).collect().await.unwrap();
        assert!(status.available);
        assert!(status.version.unwrap().starts_with("nftables v"));
        assert_eq!(status.ip_forwarding, Some(false));
        assert_eq!(status.tables.len(), 2);

        let filter = status.tables.iter().find(|t| t.name == "filter").unwrap();
        assert_eq!((filter.chains, filter.rules), (1, 1));
    }

    #[tokio::test]
    async fn missing_engine_reports_unavailable() {
        let nft = FakeNft::uninstalled();
        let host = FakeHost::new();

        let status = StatusCollector::new(&nft, &host).collect().await.unwrap();
        assert!(!status.available);
        assert!(status.tables.is_empty());
        assert!(nft.commands().is_empty());
    }
}
