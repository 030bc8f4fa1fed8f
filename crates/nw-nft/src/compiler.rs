use crate::command::NftCommand;
use nw_core::{
    Address, Family, FwError, HookSpec, Intent, Position, Protocol, Target, Verdict, normalize_quota,
};
use std::net::IpAddr;

/// Anchors tried, in order, for raw payload matching
const PAYLOAD_ANCHORS: &[&str] = &["th", "ih"];

/// One unit of work produced by the compiler
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Create-if-absent; nft failure is read as "already exists" and ignored
    Ensure(NftCommand),
    /// Must succeed, otherwise the intent stops here
    Run(NftCommand),
    /// Ordered candidates, first success wins
    FirstOf(Vec<Candidate>),
    /// Turn on IPv4 forwarding on the host
    EnableForwarding,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub label: String,
    pub command: NftCommand,
}

/// Translate an intent into the ordered steps that realise it
pub fn compile(intent: &Intent) -> Result<Vec<Step>, FwError> {
    intent.validate()?;

    let steps = match intent {
        Intent::EnsureTable { table } => vec![Step::Ensure(NftCommand::add_table(table))],
        Intent::EnsureChain { chain, hook } => vec![
            Step::Ensure(NftCommand::add_table(&chain.table_ref())),
            Step::Ensure(NftCommand::add_chain(chain, hook.as_ref())),
        ],
        Intent::FilterAddress {
            target,
            address,
            direction,
            verdict,
            position,
        } => {
            let statement = vec![
                address.protocol().to_string(),
                direction.field().to_string(),
                address.to_string(),
                verdict.as_str().to_string(),
            ];
            with_filter_prerequisites(target, NftCommand::rule(target, *position, &statement))
        }
        Intent::FilterPort {
            target,
            port,
            protocol,
            verdict,
        } => {
            let statement = vec![
                protocol.as_str().to_string(),
                "dport".to_string(),
                port.to_string(),
                verdict.as_str().to_string(),
            ];
            with_filter_prerequisites(target, NftCommand::rule(target, Position::Append, &statement))
        }
        Intent::PortForward {
            nat,
            local_port,
            remote_ip,
            remote_port,
            protocol,
        } => {
            let prerouting = nat.chain("prerouting");
            let postrouting = nat.chain("postrouting");

            let mut dnat = port_match(*protocol, *local_port);
            dnat.extend(nat_statement("dnat", nat.family, remote_ip, Some(*remote_port)));

            let masquerade = vec![
                Address::from(*remote_ip).protocol().to_string(),
                "daddr".to_string(),
                remote_ip.to_string(),
                protocol.as_str().to_string(),
                "dport".to_string(),
                remote_port.to_string(),
                "masquerade".to_string(),
            ];

            vec![
                Step::Ensure(NftCommand::add_table(nat)),
                Step::Ensure(NftCommand::add_chain(&prerouting, Some(&HookSpec::nat_prerouting()))),
                Step::Ensure(NftCommand::add_chain(&postrouting, Some(&HookSpec::nat_postrouting()))),
                Step::Run(NftCommand::rule(&prerouting, Position::Append, &dnat)),
                Step::Run(NftCommand::rule(&postrouting, Position::Append, &masquerade)),
                Step::EnableForwarding,
            ]
        }
        Intent::Snat {
            nat,
            source,
            public_ip,
        } => {
            let postrouting = nat.chain("postrouting");
            let mut statement = vec![
                source.protocol().to_string(),
                "saddr".to_string(),
                source.to_string(),
            ];
            statement.extend(nat_statement("snat", nat.family, public_ip, None));

            vec![
                Step::Ensure(NftCommand::add_table(nat)),
                Step::Ensure(NftCommand::add_chain(&postrouting, Some(&HookSpec::nat_postrouting()))),
                Step::Run(NftCommand::rule(&postrouting, Position::Append, &statement)),
            ]
        }
        Intent::Dnat {
            nat,
            public_port,
            private_ip,
            private_port,
            protocol,
        } => {
            let prerouting = nat.chain("prerouting");
            let mut statement = port_match(*protocol, *public_port);
            statement.extend(nat_statement("dnat", nat.family, private_ip, Some(*private_port)));

            vec![
                Step::Ensure(NftCommand::add_table(nat)),
                Step::Ensure(NftCommand::add_chain(&prerouting, Some(&HookSpec::nat_prerouting()))),
                Step::Run(NftCommand::rule(&prerouting, Position::Append, &statement)),
            ]
        }
        Intent::Masquerade { nat, interface } => {
            let postrouting = nat.chain("postrouting");
            let mut statement = vec![];
            if let Some(iface) = interface {
                statement.push("oifname".to_string());
                statement.push(format!("\"{}\"", iface));
            }
            statement.push("masquerade".to_string());

            vec![
                Step::Ensure(NftCommand::add_table(nat)),
                Step::Ensure(NftCommand::add_chain(&postrouting, Some(&HookSpec::nat_postrouting()))),
                Step::Run(NftCommand::rule(&postrouting, Position::Append, &statement)),
            ]
        }
        Intent::SetCreate {
            table,
            name,
            element_type,
            flags,
            elements,
        } => {
            let mut steps = vec![
                Step::Ensure(NftCommand::add_table(table)),
                Step::Run(NftCommand::create_set(table, name, element_type, flags)),
            ];
            if !elements.is_empty() {
                steps.push(Step::Run(NftCommand::add_elements(table, name, elements)));
            }
            steps
        }
        Intent::SetAdd {
            table,
            name,
            elements,
        } => vec![Step::Run(NftCommand::add_elements(table, name, elements))],
        Intent::SetDelete {
            table,
            name,
            elements,
        } => vec![Step::Run(NftCommand::delete_elements(table, name, elements))],
        Intent::SetList { table, name } => vec![Step::Run(NftCommand::list_set(table, name))],
        Intent::DeleteSet { table, name } => vec![Step::Run(NftCommand::delete_set(table, name))],
        Intent::MapCreate {
            table,
            name,
            key_type,
            value_type,
        } => vec![
            Step::Ensure(NftCommand::add_table(table)),
            Step::Run(NftCommand::create_map(table, name, key_type, value_type)),
        ],
        Intent::EnableLog {
            target,
            prefix,
            level,
        } => {
            let statement = vec![
                "log".to_string(),
                "prefix".to_string(),
                format!("\"{}\"", prefix),
                "level".to_string(),
                level.clone(),
            ];
            with_filter_prerequisites(target, NftCommand::rule(target, Position::Append, &statement))
        }
        Intent::CreateCounter { table, name } => vec![
            Step::Ensure(NftCommand::add_table(table)),
            Step::Run(NftCommand::add_counter(table, name)),
        ],
        Intent::SetQuota { target, quota } => {
            let mut statement = vec!["quota".to_string(), "over".to_string()];
            statement.extend(normalize_quota(quota)?.split(' ').map(str::to_string));
            statement.push(Verdict::Drop.as_str().to_string());
            with_filter_prerequisites(target, NftCommand::rule(target, Position::Append, &statement))
        }
        Intent::PayloadMatch {
            target,
            pattern,
            port,
            offset,
            verdict,
        } => {
            let candidates = payload_candidates(target, pattern, *port, *offset, *verdict);
            let mut steps = filter_prerequisites(target);
            steps.push(Step::FirstOf(candidates));
            steps
        }
        Intent::DeleteTable { table } => vec![Step::Run(NftCommand::delete_table(table))],
        Intent::DeleteChain { chain } => vec![Step::Run(NftCommand::delete_chain(chain))],
        Intent::DeleteRule { chain, handle } => {
            vec![Step::Run(NftCommand::delete_rule(chain, *handle))]
        }
        Intent::FlushTable { table } => vec![Step::Run(NftCommand::flush_table(table))],
        Intent::FlushChain { chain } => vec![Step::Run(NftCommand::flush_chain(chain))],
        Intent::FlushRuleset => vec![Step::Run(NftCommand::flush_ruleset())],
        Intent::ListRuleset { handles } => vec![Step::Run(NftCommand::list_ruleset(*handles))],
        Intent::ListTables => vec![Step::Run(NftCommand::list_tables())],
        Intent::ListTable { table, handles } => {
            vec![Step::Run(NftCommand::list_table(table, *handles))]
        }
        Intent::ListChain { chain, handles } => {
            vec![Step::Run(NftCommand::list_chain(chain, *handles))]
        }
    };

    Ok(steps)
}

/// Table and chain a filter rule needs, created lazily
fn filter_prerequisites(target: &Target) -> Vec<Step> {
    let hook = HookSpec::default_for_chain(&target.chain);
    vec![
        Step::Ensure(NftCommand::add_table(&target.table_ref())),
        Step::Ensure(NftCommand::add_chain(target, hook.as_ref())),
    ]
}

fn with_filter_prerequisites(target: &Target, rule: NftCommand) -> Vec<Step> {
    let mut steps = filter_prerequisites(target);
    steps.push(Step::Run(rule));
    steps
}

fn port_match(protocol: Protocol, port: u16) -> Vec<String> {
    vec![
        protocol.as_str().to_string(),
        "dport".to_string(),
        port.to_string(),
    ]
}

/// `dnat to 10.0.0.2:80`; inet tables need the address family spelled out
fn nat_statement(kind: &str, family: Family, ip: &IpAddr, port: Option<u16>) -> Vec<String> {
    let mut statement = vec![kind.to_string()];
    if family == Family::Inet {
        statement.push(Address::from(*ip).protocol().to_string());
    }
    statement.push("to".to_string());

    let addr = match (ip, port) {
        (IpAddr::V4(v4), Some(port)) => format!("{}:{}", v4, port),
        (IpAddr::V6(v6), Some(port)) => format!("[{}]:{}", v6, port),
        (ip, None) => ip.to_string(),
    };
    statement.push(addr);
    statement
}

/// Raw payload window over the literal: byte offset and length become bit
/// offset and bit length relative to the anchor header.
fn payload_candidates(
    target: &Target,
    pattern: &str,
    port: u16,
    offset: u32,
    verdict: Verdict,
) -> Vec<Candidate> {
    let bit_offset = u64::from(offset) * 8;
    let bit_len = pattern.len() as u64 * 8;
    let hex: String = pattern.bytes().map(|b| format!("{:02x}", b)).collect();

    PAYLOAD_ANCHORS
        .iter()
        .map(|anchor| {
            let mut statement = port_match(Protocol::Tcp, port);
            statement.push(format!("@{},{},{}", anchor, bit_offset, bit_len));
            statement.push(format!("0x{}", hex));
            statement.push(verdict.as_str().to_string());
            Candidate {
                label: format!("@{} anchor", anchor),
                command: NftCommand::rule(target, Position::Append, &statement),
            }
        })
        .collect()
}

/// Commands of a compiled plan in execution order, for dry runs
pub fn describe(steps: &[Step]) -> Vec<String> {
    steps
        .iter()
        .map(|step| match step {
            Step::Ensure(cmd) => format!("{} (if absent)", cmd),
            Step::Run(cmd) => cmd.to_string(),
            Step::FirstOf(candidates) => candidates
                .iter()
                .map(|c| c.command.to_string())
                .collect::<Vec<_>>()
                .join("  ||  "),
            Step::EnableForwarding => "sysctl net.ipv4.ip_forward=1".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nw_core::{Direction, TableRef};

    fn commands(steps: &[Step]) -> Vec<String> {
        steps
            .iter()
            .filter_map(|s| match s {
                Step::Ensure(c) | Step::Run(c) => Some(c.to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn block_address_ensures_table_and_base_chain() {
        let intent = Intent::block_address(Target::default(), "203.0.113.7".parse().unwrap());
        let steps = compile(&intent).unwrap();

        assert_eq!(
            commands(&steps),
            vec![
                "nft add table inet filter",
                "nft add chain inet filter input { type filter hook input priority 0 ; }",
                "nft add rule inet filter input ip saddr 203.0.113.7 drop",
            ]
        );
        assert!(matches!(steps[0], Step::Ensure(_)));
        assert!(matches!(steps[2], Step::Run(_)));
    }

    #[test]
    fn custom_chain_is_created_without_hook() {
        let target = Target::new(Family::Inet, "filter", "blocked");
        let intent = Intent::FilterPort {
            target,
            port: 22,
            protocol: Protocol::Tcp,
            verdict: Verdict::Accept,
        };
        let steps = compile(&intent).unwrap();
        assert_eq!(
            commands(&steps)[1],
            "nft add chain inet filter blocked"
        );
        assert_eq!(
            commands(&steps)[2],
            "nft add rule inet filter blocked tcp dport 22 accept"
        );
    }

    #[test]
    fn port_forward_builds_dnat_masquerade_and_forwarding() {
        let intent = Intent::PortForward {
            nat: TableRef::new(Family::Ip, "nat"),
            local_port: 8080,
            remote_ip: "192.168.1.10".parse().unwrap(),
            remote_port: 80,
            protocol: Protocol::Tcp,
        };
        let steps = compile(&intent).unwrap();

        assert_eq!(
            commands(&steps),
            vec![
                "nft add table ip nat",
                "nft add chain ip nat prerouting { type nat hook prerouting priority -100 ; }",
                "nft add chain ip nat postrouting { type nat hook postrouting priority 100 ; }",
                "nft add rule ip nat prerouting tcp dport 8080 dnat to 192.168.1.10:80",
                "nft add rule ip nat postrouting ip daddr 192.168.1.10 tcp dport 80 masquerade",
            ]
        );
        assert_eq!(steps.last(), Some(&Step::EnableForwarding));
    }

    #[test]
    fn inet_nat_spells_out_family() {
        let intent = Intent::Snat {
            nat: TableRef::new(Family::Inet, "nat"),
            source: "10.0.0.0/24".parse().unwrap(),
            public_ip: "198.51.100.1".parse().unwrap(),
        };
        let steps = compile(&intent).unwrap();
        assert_eq!(
            commands(&steps)[2],
            "nft add rule inet nat postrouting ip saddr 10.0.0.0/24 snat ip to 198.51.100.1"
        );
    }

    #[test]
    fn masquerade_scopes_to_interface() {
        let intent = Intent::Masquerade {
            nat: TableRef::new(Family::Ip, "nat"),
            interface: Some("eth0".into()),
        };
        let steps = compile(&intent).unwrap();
        assert_eq!(
            commands(&steps)[2],
            "nft add rule ip nat postrouting oifname \"eth0\" masquerade"
        );
    }

    #[test]
    fn whitelist_style_rule_is_inserted() {
        let intent = Intent::FilterAddress {
            target: Target::default().with_chain("output"),
            address: "10.9.8.7".parse().unwrap(),
            direction: Direction::Destination,
            verdict: Verdict::Accept,
            position: Position::Insert,
        };
        let steps = compile(&intent).unwrap();
        assert_eq!(
            commands(&steps)[2],
            "nft insert rule inet filter output ip daddr 10.9.8.7 accept"
        );
    }

    #[test]
    fn quota_and_log_rules() {
        let quota = Intent::SetQuota {
            target: Target::default(),
            quota: "10 mbytes".into(),
        };
        assert_eq!(
            commands(&compile(&quota).unwrap())[2],
            "nft add rule inet filter input quota over 10 mbytes drop"
        );

        let log = Intent::EnableLog {
            target: Target::default(),
            prefix: "nftwarden: ".into(),
            level: "info".into(),
        };
        assert_eq!(
            commands(&compile(&log).unwrap())[2],
            "nft add rule inet filter input log prefix \"nftwarden: \" level info"
        );
    }

    #[test]
    fn payload_match_offers_transport_then_inner_anchor() {
        let intent = Intent::PayloadMatch {
            target: Target::default(),
            pattern: "curl".into(),
            port: 80,
            offset: 20,
            verdict: Verdict::Drop,
        };
        let steps = compile(&intent).unwrap();

        match steps.last().unwrap() {
            Step::FirstOf(candidates) => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(
                    candidates[0].command.to_string(),
                    "nft add rule inet filter input tcp dport 80 @th,160,32 0x6375726c drop"
                );
                assert!(candidates[1].command.to_string().contains("@ih,160,32"));
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn invalid_intent_compiles_to_nothing() {
        let intent = Intent::PayloadMatch {
            target: Target::default(),
            pattern: String::new(),
            port: 80,
            offset: 0,
            verdict: Verdict::Drop,
        };
        assert!(compile(&intent).unwrap_err().is_invalid_arguments());
    }

    #[test]
    fn set_create_is_not_an_ensure_step() {
        let intent = Intent::SetCreate {
            table: TableRef::new(Family::Inet, "filter"),
            name: "blocked".into(),
            element_type: "ipv4_addr".into(),
            flags: vec![],
            elements: vec!["1.2.3.4".into(), "5.6.7.8".into()],
        };
        let steps = compile(&intent).unwrap();
        assert!(matches!(&steps[1], Step::Run(c) if c.args[0] == "create"));
        assert_eq!(
            commands(&steps)[2],
            "nft add element inet filter blocked { 1.2.3.4, 5.6.7.8 }"
        );
    }
}
