use crate::command::NftCommand;
use crate::compiler::{Step, compile, describe};
use crate::engine::NftEngine;
use crate::handles::{ListedRule, RulePredicate, matching_handles, parse_chain_listing};
use crate::host::Host;
use nw_core::{ApplyReport, FwError, Intent, Target};
use std::cell::Cell;
use tracing::{debug, info, warn};

/// Runs compiled intents against an engine, one step at a time.
///
/// There is no rollback: when a `Run` step fails, everything before it stays
/// applied and the error lists what completed.
pub struct Applier<E, H> {
    engine: E,
    host: H,
    engine_checked: Cell<bool>,
}

impl<E: NftEngine, H: Host> Applier<E, H> {
    pub fn new(engine: E, host: H) -> Self {
        Self {
            engine,
            host,
            engine_checked: Cell::new(false),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Commands an intent would run, without touching the engine
    pub fn plan(&self, intent: &Intent) -> Result<Vec<String>, FwError> {
        Ok(describe(&compile(intent)?))
    }

    /// Install nft once per applier if the binary is missing
    pub async fn ensure_engine(&self) -> Result<(), FwError> {
        if self.engine_checked.get() {
            return Ok(());
        }

        if !self.engine.available().await {
            warn!("nft not found, installing nftables");
            self.host.install_engine().await?;
            if !self.engine.available().await {
                return Err(FwError::PrerequisiteMissing(
                    "nft is still unavailable after installing nftables".to_string(),
                ));
            }
        }

        self.engine_checked.set(true);
        Ok(())
    }

    /// Compile and apply one intent
    pub async fn apply(&self, intent: &Intent) -> Result<ApplyReport, FwError> {
        let steps = compile(intent)?;
        self.ensure_engine().await?;

        info!(intent = intent.name(), "applying {}", intent);
        let mut report = ApplyReport::new(intent.to_string());

        for step in &steps {
            if let Err(source) = self.run_step(step, &mut report).await {
                return Err(FwError::IntentFailed {
                    intent: intent.name().to_string(),
                    completed: report.completed_commands(),
                    source: Box::new(source),
                });
            }
        }

        debug!(intent = intent.name(), steps = report.steps.len(), "intent applied");
        Ok(report)
    }

    async fn run_step(&self, step: &Step, report: &mut ApplyReport) -> Result<(), FwError> {
        match step {
            Step::Ensure(cmd) => match self.engine.execute(cmd).await {
                Ok(output) => report.applied(cmd.to_string(), output),
                Err(FwError::EngineRejected { stderr, .. }) => {
                    warn!(command = %cmd, %stderr, "ensure step refused, assuming it exists");
                    report.suppressed(cmd.to_string(), stderr);
                }
                Err(e) => return Err(e),
            },
            Step::Run(cmd) => {
                let output = self.engine.execute(cmd).await?;
                report.applied(cmd.to_string(), output);
            }
            Step::FirstOf(candidates) => {
                let mut failures = vec![];
                for candidate in candidates {
                    match self.engine.execute(&candidate.command).await {
                        Ok(output) => {
                            info!(strategy = %candidate.label, "strategy succeeded");
                            report.applied(candidate.command.to_string(), output);
                            return Ok(());
                        }
                        Err(e) => {
                            debug!(strategy = %candidate.label, error = %e, "strategy failed");
                            failures.push(format!("{}: {}", candidate.label, e));
                        }
                    }
                }
                return Err(FwError::StrategiesExhausted(failures));
            }
            Step::EnableForwarding => {
                self.host.enable_ip_forwarding().await?;
                report.applied("sysctl net.ipv4.ip_forward=1", "");
            }
        }
        Ok(())
    }

    /// Run a single command outside any intent
    pub async fn run(&self, command: &NftCommand) -> Result<String, FwError> {
        self.ensure_engine().await?;
        self.engine.execute(command).await
    }

    /// Rules of a chain with their handles
    pub async fn list_rules(&self, chain: &Target) -> Result<Vec<ListedRule>, FwError> {
        let output = self.run(&NftCommand::list_chain_json(chain)).await?;
        parse_chain_listing(&output)
    }

    /// Delete every rule of `chain` the predicate selects, returning their handles.
    ///
    /// Listing and deletion are separate nft calls: a rule added or removed
    /// by someone else in between is not seen, and a handle that vanished
    /// makes the corresponding delete fail.
    pub async fn delete_matching(
        &self,
        chain: &Target,
        predicate: &RulePredicate,
    ) -> Result<Vec<u64>, FwError> {
        let rules = self.list_rules(chain).await?;
        let handles = matching_handles(&rules, predicate);

        for handle in &handles {
            self.engine
                .execute(&NftCommand::delete_rule(chain, *handle))
                .await?;
        }

        if handles.is_empty() {
            debug!(chain = %chain, "no matching rules to delete");
        } else {
            info!(chain = %chain, count = handles.len(), "deleted matching rules");
        }
        Ok(handles)
    }
}
