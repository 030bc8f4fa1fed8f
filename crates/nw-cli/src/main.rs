use anyhow::{Context as _, bail};
use clap::{Args, Parser, Subcommand};
use nw_core::{
    Address, ChainType, Direction, Family, Hook, HookSpec, Intent, Position, Protocol, Settings, TableRef,
    Target, Verdict,
};
use nw_dns::{SystemResolver, block_domain, resolve_detection_ips};
use nw_lists::{FileListStore, ListChange, ListKind, ListManager};
use nw_nft::{Applier, NftCli, SnapshotManager, StatusCollector, SystemHost};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nwarden")]
#[command(version, about = "nftables rule intents, applied idempotently", long_about = None)]
struct Cli {
    /// Settings file (default: /etc/nftwarden/config.yaml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the nft commands instead of running them
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Table management
    Table {
        #[command(subcommand)]
        action: TableAction,
    },
    /// Chain management
    Chain {
        #[command(subcommand)]
        action: ChainAction,
    },
    /// Address and port filter rules
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },
    /// Port forwarding and address translation
    Nat {
        #[command(subcommand)]
        action: NatAction,
    },
    /// Named sets
    Set {
        #[command(subcommand)]
        action: SetAction,
    },
    /// Named maps
    Map {
        #[command(subcommand)]
        action: MapAction,
    },
    /// Show ruleset or tables
    List {
        #[command(subcommand)]
        action: ListAction,
    },
    /// Addresses dropped in both directions
    Blacklist {
        #[command(subcommand)]
        action: NamedListAction,
    },
    /// Addresses accepted ahead of every other rule
    Whitelist {
        #[command(subcommand)]
        action: NamedListAction,
    },
    /// Create a named counter
    Counter {
        name: String,
        #[command(flatten)]
        table: TableArgs,
    },
    /// Drop traffic once a byte quota is exceeded
    Quota {
        /// e.g. "100 mbytes" or 1gbytes
        quota: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Log matching packets
    Log {
        #[arg(long)]
        prefix: String,
        /// Syslog level (default from settings)
        #[arg(long)]
        level: Option<String>,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Match a literal string in TCP payload (fragile, plaintext protocols only)
    Payload {
        pattern: String,
        #[arg(long, default_value = "80")]
        port: u16,
        /// Byte offset from the start of the payload window
        #[arg(long, default_value = "0")]
        offset: u32,
        #[arg(long, default_value = "drop")]
        verdict: Verdict,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Show the IPv4 addresses a domain resolves to
    Resolve { domain: String },
    /// Resolve a domain and block every address
    BlockDomain {
        domain: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Save the live ruleset to the backup directory
    Backup {
        /// List saved snapshots instead
        #[arg(long)]
        list: bool,
    },
    /// Load a saved ruleset
    Restore {
        path: PathBuf,
        /// Flush the live ruleset first
        #[arg(long)]
        flush: bool,
    },
    /// Compare a saved ruleset with the live one
    Diff { path: PathBuf },
    /// Engine, forwarding and table overview
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Remove every table, chain and rule
    Flush,
}

#[derive(Args)]
struct TableArgs {
    #[arg(long)]
    family: Option<Family>,
    #[arg(long)]
    table: Option<String>,
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long)]
    family: Option<Family>,
    #[arg(long)]
    table: Option<String>,
    #[arg(long)]
    chain: Option<String>,
}

#[derive(Subcommand)]
enum TableAction {
    /// Create a table if it does not exist
    Add {
        name: String,
        #[arg(long)]
        family: Option<Family>,
    },
    Delete {
        name: String,
        #[arg(long)]
        family: Option<Family>,
    },
    /// Remove every rule in the table
    Flush {
        name: String,
        #[arg(long)]
        family: Option<Family>,
    },
    List {
        name: String,
        #[arg(long)]
        family: Option<Family>,
        #[arg(long)]
        handles: bool,
    },
}

#[derive(Subcommand)]
enum ChainAction {
    /// Create a chain if it does not exist
    Add {
        name: String,
        #[command(flatten)]
        table: TableArgs,
        /// Attach to a hook, making this a base chain
        #[arg(long)]
        hook: Option<Hook>,
        #[arg(long = "type", default_value = "filter")]
        chain_type: ChainType,
        #[arg(long, allow_negative_numbers = true)]
        priority: Option<i32>,
    },
    Delete {
        name: String,
        #[command(flatten)]
        table: TableArgs,
    },
    Flush {
        name: String,
        #[command(flatten)]
        table: TableArgs,
    },
    List {
        name: String,
        #[command(flatten)]
        table: TableArgs,
        #[arg(long)]
        handles: bool,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    AllowIp {
        address: Address,
        /// Match the destination instead of the source
        #[arg(long)]
        destination: bool,
        /// Put the rule at the head of the chain
        #[arg(long)]
        insert: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
    BlockIp {
        address: Address,
        #[arg(long)]
        destination: bool,
        #[arg(long)]
        insert: bool,
        #[command(flatten)]
        target: TargetArgs,
    },
    AllowPort {
        port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: Protocol,
        #[command(flatten)]
        target: TargetArgs,
    },
    BlockPort {
        port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: Protocol,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Delete one rule by handle (see `chain list --handles`)
    Delete {
        #[arg(long)]
        handle: u64,
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Subcommand)]
enum NatAction {
    /// Forward a local port to another host, with masquerade for replies
    Forward {
        local_port: u16,
        remote_ip: IpAddr,
        remote_port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: Protocol,
    },
    /// Rewrite the source of outgoing traffic from a network
    Snat { source: Address, public_ip: IpAddr },
    /// Send traffic for a public port to a private host
    Dnat {
        public_port: u16,
        private_ip: IpAddr,
        private_port: u16,
        #[arg(long, default_value = "tcp")]
        protocol: Protocol,
    },
    Masquerade {
        /// Outgoing interface
        #[arg(long)]
        interface: Option<String>,
    },
}

#[derive(Subcommand)]
enum SetAction {
    /// Create a set; fails if it already exists
    Create {
        name: String,
        #[arg(long = "type", default_value = "ipv4_addr")]
        element_type: String,
        #[arg(long, value_delimiter = ',')]
        flags: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        elements: Vec<String>,
        #[command(flatten)]
        table: TableArgs,
    },
    Add {
        name: String,
        #[arg(required = true)]
        elements: Vec<String>,
        #[command(flatten)]
        table: TableArgs,
    },
    Delete {
        name: String,
        #[arg(required = true)]
        elements: Vec<String>,
        #[command(flatten)]
        table: TableArgs,
    },
    List {
        name: String,
        #[command(flatten)]
        table: TableArgs,
    },
    /// Delete the set itself
    Remove {
        name: String,
        #[command(flatten)]
        table: TableArgs,
    },
}

#[derive(Subcommand)]
enum MapAction {
    Create {
        name: String,
        #[arg(long)]
        key_type: String,
        #[arg(long)]
        value_type: String,
        #[command(flatten)]
        table: TableArgs,
    },
}

#[derive(Subcommand)]
enum ListAction {
    Ruleset {
        #[arg(long)]
        handles: bool,
    },
    Tables,
}

#[derive(Subcommand)]
enum NamedListAction {
    Add { address: Address },
    Remove { address: Address },
    Show,
    /// Re-apply the rules of every listed address
    Sync,
}

struct Context {
    settings: Settings,
    applier: Applier<NftCli, SystemHost>,
    dry_run: bool,
}

impl Context {
    fn target(&self, args: &TargetArgs) -> Target {
        self.settings
            .target(args.family, args.table.as_deref(), args.chain.as_deref())
    }

    fn table(&self, args: &TableArgs) -> TableRef {
        self.settings.table(args.family, args.table.as_deref())
    }

    fn named_table(&self, name: String, family: Option<Family>) -> TableRef {
        TableRef::new(family.unwrap_or(self.settings.defaults.family), name)
    }

    async fn apply(&self, intent: Intent) -> anyhow::Result<()> {
        if self.dry_run {
            println!("🔍 Dry run: {}", intent);
            for command in self.applier.plan(&intent)? {
                println!("   • {}", command);
            }
            return Ok(());
        }

        let report = self.applier.apply(&intent).await?;
        if is_listing(&intent) {
            println!("{}", report.output());
        } else {
            report.display();
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    init_tracing(&settings.log_level, cli.verbose);

    let ctx = Context {
        applier: Applier::new(NftCli::with_binary(&settings.nft_binary), SystemHost::new()),
        settings,
        dry_run: cli.dry_run,
    };

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run(&ctx, cli.command))
}

fn init_tracing(level: &str, verbose: bool) {
    let default = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(ctx: &Context, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Table { action } => handle_table_action(ctx, action).await?,
        Commands::Chain { action } => handle_chain_action(ctx, action).await?,
        Commands::Rule { action } => handle_rule_action(ctx, action).await?,
        Commands::Nat { action } => handle_nat_action(ctx, action).await?,
        Commands::Set { action } => handle_set_action(ctx, action).await?,
        Commands::Map { action } => match action {
            MapAction::Create {
                name,
                key_type,
                value_type,
                table,
            } => {
                ctx.apply(Intent::MapCreate {
                    table: ctx.table(&table),
                    name,
                    key_type,
                    value_type,
                })
                .await?
            }
        },
        Commands::List { action } => match action {
            ListAction::Ruleset { handles } => ctx.apply(Intent::ListRuleset { handles }).await?,
            ListAction::Tables => ctx.apply(Intent::ListTables).await?,
        },
        Commands::Blacklist { action } => {
            handle_named_list(ctx, ListKind::Blacklist, action).await?
        }
        Commands::Whitelist { action } => {
            handle_named_list(ctx, ListKind::Whitelist, action).await?
        }
        Commands::Counter { name, table } => {
            ctx.apply(Intent::CreateCounter {
                table: ctx.table(&table),
                name,
            })
            .await?
        }
        Commands::Quota { quota, target } => {
            ctx.apply(Intent::SetQuota {
                target: ctx.target(&target),
                quota,
            })
            .await?
        }
        Commands::Log {
            prefix,
            level,
            target,
        } => {
            ctx.apply(Intent::EnableLog {
                target: ctx.target(&target),
                prefix,
                level: level.unwrap_or_else(|| ctx.settings.log_rules.level.clone()),
            })
            .await?
        }
        Commands::Payload {
            pattern,
            port,
            offset,
            verdict,
            target,
        } => {
            println!("⚠️  Payload matching is best-effort and only sees unencrypted traffic");
            ctx.apply(Intent::PayloadMatch {
                target: ctx.target(&target),
                pattern,
                port,
                offset,
                verdict,
            })
            .await?
        }
        Commands::Resolve { domain } => {
            let ips = resolve_detection_ips(&SystemResolver::new(), &domain).await?;
            println!("🌐 {} resolves to:", domain);
            for ip in ips {
                println!("  • {}", ip);
            }
        }
        Commands::BlockDomain { domain, target } => {
            let target = ctx.target(&target);
            if ctx.dry_run {
                let ips = resolve_detection_ips(&SystemResolver::new(), &domain).await?;
                for ip in ips {
                    ctx.apply(Intent::block_address(target.clone(), IpAddr::V4(ip).into()))
                        .await?;
                }
            } else {
                let reports =
                    block_domain(&ctx.applier, &SystemResolver::new(), &domain, &target).await?;
                for report in &reports {
                    report.display();
                }
                println!("🚫 Blocked {} address(es) of {}", reports.len(), domain);
            }
        }
        Commands::Backup { list } => {
            let snapshots = SnapshotManager::new(&ctx.settings.backup_dir);
            if list {
                let saved = snapshots.list().await?;
                println!("💾 Snapshots in {} ({}):", snapshots.backup_dir().display(), saved.len());
                for path in saved {
                    println!("  • {}", path.display());
                }
            } else {
                ctx.applier.ensure_engine().await?;
                let path = snapshots.backup(ctx.applier.engine()).await?;
                println!("💾 Ruleset saved to {}", path.display());
            }
        }
        Commands::Restore { path, flush } => {
            if ctx.dry_run {
                println!("🔍 Dry run: would load {}", path.display());
                return Ok(());
            }
            if !path.is_file() {
                bail!("snapshot {} does not exist", path.display());
            }
            let snapshots = SnapshotManager::new(&ctx.settings.backup_dir);
            ctx.applier.ensure_engine().await?;
            snapshots.restore(ctx.applier.engine(), &path, flush).await?;
            println!("✅ Ruleset restored from {}", path.display());
        }
        Commands::Diff { path } => {
            let snapshots = SnapshotManager::new(&ctx.settings.backup_dir);
            ctx.applier.ensure_engine().await?;
            snapshots.diff(ctx.applier.engine(), &path).await?.display();
        }
        Commands::Status { json } => {
            let status = StatusCollector::new(ctx.applier.engine(), ctx.applier.host())
                .collect()
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                status.display();
            }
        }
        Commands::Flush => ctx.apply(Intent::FlushRuleset).await?,
    }

    Ok(())
}

async fn handle_table_action(ctx: &Context, action: TableAction) -> anyhow::Result<()> {
    let intent = match action {
        TableAction::Add { name, family } => Intent::EnsureTable {
            table: ctx.named_table(name, family),
        },
        TableAction::Delete { name, family } => Intent::DeleteTable {
            table: ctx.named_table(name, family),
        },
        TableAction::Flush { name, family } => Intent::FlushTable {
            table: ctx.named_table(name, family),
        },
        TableAction::List {
            name,
            family,
            handles,
        } => Intent::ListTable {
            table: ctx.named_table(name, family),
            handles,
        },
    };
    ctx.apply(intent).await
}

async fn handle_chain_action(ctx: &Context, action: ChainAction) -> anyhow::Result<()> {
    let intent = match action {
        ChainAction::Add {
            name,
            table,
            hook,
            chain_type,
            priority,
        } => {
            let hook = match hook {
                Some(hook) => Some(HookSpec::new(chain_type, hook, priority.unwrap_or(0))),
                None => HookSpec::default_for_chain(&name),
            };
            Intent::EnsureChain {
                chain: ctx.table(&table).chain(name),
                hook,
            }
        }
        ChainAction::Delete { name, table } => Intent::DeleteChain {
            chain: ctx.table(&table).chain(name),
        },
        ChainAction::Flush { name, table } => Intent::FlushChain {
            chain: ctx.table(&table).chain(name),
        },
        ChainAction::List {
            name,
            table,
            handles,
        } => Intent::ListChain {
            chain: ctx.table(&table).chain(name),
            handles,
        },
    };
    ctx.apply(intent).await
}

async fn handle_rule_action(ctx: &Context, action: RuleAction) -> anyhow::Result<()> {
    let intent = match action {
        RuleAction::AllowIp {
            address,
            destination,
            insert,
            target,
        } => address_rule(ctx.target(&target), address, Verdict::Accept, destination, insert),
        RuleAction::BlockIp {
            address,
            destination,
            insert,
            target,
        } => address_rule(ctx.target(&target), address, Verdict::Drop, destination, insert),
        RuleAction::AllowPort {
            port,
            protocol,
            target,
        } => Intent::FilterPort {
            target: ctx.target(&target),
            port,
            protocol,
            verdict: Verdict::Accept,
        },
        RuleAction::BlockPort {
            port,
            protocol,
            target,
        } => Intent::FilterPort {
            target: ctx.target(&target),
            port,
            protocol,
            verdict: Verdict::Drop,
        },
        RuleAction::Delete { handle, target } => Intent::DeleteRule {
            chain: ctx.target(&target),
            handle,
        },
    };
    ctx.apply(intent).await
}

fn address_rule(target: Target, address: Address, verdict: Verdict, destination: bool, insert: bool) -> Intent {
    Intent::FilterAddress {
        target,
        address,
        direction: if destination {
            Direction::Destination
        } else {
            Direction::Source
        },
        verdict,
        position: if insert { Position::Insert } else { Position::Append },
    }
}

async fn handle_nat_action(ctx: &Context, action: NatAction) -> anyhow::Result<()> {
    let nat = ctx.settings.nat_table();
    let intent = match action {
        NatAction::Forward {
            local_port,
            remote_ip,
            remote_port,
            protocol,
        } => Intent::PortForward {
            nat,
            local_port,
            remote_ip,
            remote_port,
            protocol,
        },
        NatAction::Snat { source, public_ip } => Intent::Snat {
            nat,
            source,
            public_ip,
        },
        NatAction::Dnat {
            public_port,
            private_ip,
            private_port,
            protocol,
        } => Intent::Dnat {
            nat,
            public_port,
            private_ip,
            private_port,
            protocol,
        },
        NatAction::Masquerade { interface } => Intent::Masquerade { nat, interface },
    };
    ctx.apply(intent).await
}

async fn handle_set_action(ctx: &Context, action: SetAction) -> anyhow::Result<()> {
    let intent = match action {
        SetAction::Create {
            name,
            element_type,
            flags,
            elements,
            table,
        } => Intent::SetCreate {
            table: ctx.table(&table),
            name,
            element_type,
            flags,
            elements,
        },
        SetAction::Add {
            name,
            elements,
            table,
        } => Intent::SetAdd {
            table: ctx.table(&table),
            name,
            elements,
        },
        SetAction::Delete {
            name,
            elements,
            table,
        } => Intent::SetDelete {
            table: ctx.table(&table),
            name,
            elements,
        },
        SetAction::List { name, table } => Intent::SetList {
            table: ctx.table(&table),
            name,
        },
        SetAction::Remove { name, table } => Intent::DeleteSet {
            table: ctx.table(&table),
            name,
        },
    };
    ctx.apply(intent).await
}

async fn handle_named_list(ctx: &Context, kind: ListKind, action: NamedListAction) -> anyhow::Result<()> {
    let lists = &ctx.settings.lists;
    let path = match kind {
        ListKind::Blacklist => &lists.blacklist,
        ListKind::Whitelist => &lists.whitelist,
    };
    let input = ctx.settings.target(None, None, Some(&lists.input_chain));
    let output = ctx.settings.target(None, None, Some(&lists.output_chain));

    if ctx.dry_run {
        if let NamedListAction::Add { address } = &action {
            for (target, direction) in [
                (input, Direction::Source),
                (output, Direction::Destination),
            ] {
                ctx.apply(Intent::FilterAddress {
                    target,
                    address: *address,
                    direction,
                    verdict: kind.verdict(),
                    position: kind.position(),
                })
                .await?;
            }
            return Ok(());
        }
        bail!("--dry-run only previews `{} add`", kind);
    }

    let manager = ListManager::new(&ctx.applier, kind, FileListStore::new(path), input, output);

    match action {
        NamedListAction::Add { address } => match manager.add(address).await? {
            ListChange::AlreadyListed => println!("ℹ️  {} is already on the {}", address, kind),
            _ => println!("✅ Added {} to the {}", address, kind),
        },
        NamedListAction::Remove { address } => match manager.remove(address).await? {
            ListChange::Removed { input, output } => println!(
                "✅ Removed {} from the {} ({} rule(s) deleted)",
                address,
                kind,
                input.len() + output.len()
            ),
            _ => println!("ℹ️  {} is not on the {}", address, kind),
        },
        NamedListAction::Show => {
            let entries = manager.entries()?;
            println!("📋 {} ({}):", kind, entries.len());
            if entries.is_empty() {
                println!("  (empty)");
            }
            for address in entries {
                println!("  • {}", address);
            }
        }
        NamedListAction::Sync => {
            let count = manager.sync().await?;
            println!("✅ Re-applied rules for {} {} address(es)", count, kind);
        }
    }

    Ok(())
}

fn is_listing(intent: &Intent) -> bool {
    matches!(
        intent,
        Intent::ListRuleset { .. }
            | Intent::ListTables
            | Intent::ListTable { .. }
            | Intent::ListChain { .. }
            | Intent::SetList { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn negative_priority_parses() {
        let cli = Cli::try_parse_from([
            "nwarden", "chain", "add", "prerouting", "--table", "nat", "--family", "ip", "--hook",
            "prerouting", "--type", "nat", "--priority", "-100",
        ])
        .unwrap();
        match cli.command {
            Commands::Chain {
                action: ChainAction::Add { priority, hook, .. },
            } => {
                assert_eq!(priority, Some(-100));
                assert_eq!(hook, Some(Hook::Prerouting));
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn set_flags_split_on_commas() {
        let cli = Cli::try_parse_from([
            "nwarden", "set", "create", "blocked", "--flags", "interval,timeout",
        ])
        .unwrap();
        match cli.command {
            Commands::Set {
                action: SetAction::Create { flags, .. },
            } => assert_eq!(flags, vec!["interval", "timeout"]),
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn invalid_address_is_rejected_by_parser() {
        assert!(Cli::try_parse_from(["nwarden", "blacklist", "add", "not-an-ip"]).is_err());
    }
}
