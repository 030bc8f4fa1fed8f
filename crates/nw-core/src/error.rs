use thiserror::Error;

/// Errors surfaced by intent compilation and application
#[derive(Debug, Error)]
pub enum FwError {
    /// A required parameter is missing or malformed; nothing was sent to nft
    #[error("invalid arguments for {intent}: {reason}")]
    InvalidArguments { intent: &'static str, reason: String },

    /// Something the operation depends on does not exist (restore file, nft binary)
    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    /// nft exited non-zero. The cause is ambiguous: duplicate object, syntax or permissions
    #[error("nft rejected `{command}`: {stderr}")]
    EngineRejected {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    #[error("no addresses resolved for {0}")]
    UnresolvableName(String),

    /// Every candidate of an ordered fallback list failed
    #[error("all strategies failed: {}", .0.join("; "))]
    StrategiesExhausted(Vec<String>),

    /// A step of a multi-step intent failed; earlier steps stay applied
    #[error("{intent} failed after {} completed step(s): {source}", .completed.len())]
    IntentFailed {
        intent: String,
        completed: Vec<String>,
        #[source]
        source: Box<FwError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse nft JSON output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),
}

impl FwError {
    pub fn invalid(intent: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            intent,
            reason: reason.into(),
        }
    }

    pub fn is_invalid_arguments(&self) -> bool {
        matches!(self, Self::InvalidArguments { .. })
    }

    /// The innermost error, looking through `IntentFailed` wrappers
    pub fn root(&self) -> &FwError {
        match self {
            Self::IntentFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_failure_reports_progress_and_cause() {
        let err = FwError::IntentFailed {
            intent: "port-forward".into(),
            completed: vec!["nft add table ip nat".into()],
            source: Box::new(FwError::EngineRejected {
                command: "nft add rule ip nat prerouting".into(),
                stderr: "Error: syntax error".into(),
                exit_code: Some(1),
            }),
        };

        let message = err.to_string();
        assert!(message.starts_with("port-forward failed after 1 completed step(s)"));
        assert!(message.contains("syntax error"));
        assert!(matches!(err.root(), FwError::EngineRejected { .. }));
    }

    #[test]
    fn exhausted_strategies_are_joined() {
        let err = FwError::StrategiesExhausted(vec!["@th: rejected".into(), "@ih: rejected".into()]);
        assert_eq!(
            err.to_string(),
            "all strategies failed: @th: rejected; @ih: rejected"
        );
    }
}
