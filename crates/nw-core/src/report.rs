use serde::{Deserialize, Serialize};

/// What happened to one primitive operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepOutcome {
    Applied,
    /// An ensure step nft refused; treated as "already exists"
    Suppressed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub command: String,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

/// Structured result of one applied intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub intent: String,
    pub steps: Vec<StepRecord>,
}

impl ApplyReport {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            steps: vec![],
        }
    }

    pub fn applied(&mut self, command: impl Into<String>, output: impl Into<String>) {
        self.steps.push(StepRecord {
            command: command.into(),
            outcome: StepOutcome::Applied,
            output: output.into(),
        });
    }

    pub fn suppressed(&mut self, command: impl Into<String>, reason: impl Into<String>) {
        self.steps.push(StepRecord {
            command: command.into(),
            outcome: StepOutcome::Suppressed {
                reason: reason.into(),
            },
            output: String::new(),
        });
    }

    /// Commands that went through, in order
    pub fn completed_commands(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.command.clone()).collect()
    }

    /// Concatenated stdout of all steps (listing intents)
    pub fn output(&self) -> String {
        self.steps
            .iter()
            .filter(|s| !s.output.trim().is_empty())
            .map(|s| s.output.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn display(&self) {
        println!("✅ {}", self.intent);
        for step in &self.steps {
            match &step.outcome {
                StepOutcome::Applied => println!("   • {}", step.command),
                StepOutcome::Suppressed { reason } => {
                    println!("   • {} (skipped: {})", step.command, reason.trim())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_skips_empty_steps() {
        let mut report = ApplyReport::new("list chain");
        report.suppressed("nft add table inet filter", "exists");
        report.applied("nft list chain inet filter input", "table inet filter {\n}\n");
        report.applied("nft add rule inet filter input drop", "");

        assert_eq!(report.output(), "table inet filter {\n}");
        assert_eq!(report.completed_commands().len(), 3);
    }
}
