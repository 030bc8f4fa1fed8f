use crate::command::NftCommand;
use nw_core::FwError;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// The packet-filtering engine as seen by the applier
#[allow(async_fn_in_trait)]
pub trait NftEngine {
    /// Whether the engine binary can be invoked at all
    async fn available(&self) -> bool;

    /// Run one command, returning stdout on success
    async fn execute(&self, command: &NftCommand) -> Result<String, FwError>;
}

/// Engine backed by the `nft` command-line tool
pub struct NftCli {
    binary: String,
}

impl NftCli {
    pub fn new() -> Self {
        Self::with_binary("nft")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for NftCli {
    fn default() -> Self {
        Self::new()
    }
}

impl NftEngine for NftCli {
    async fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn execute(&self, command: &NftCommand) -> Result<String, FwError> {
        debug!(command = %command, "running nft");

        let mut child = Command::new(&self.binary)
            .args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    FwError::PrerequisiteMissing(format!("{} is not installed", self.binary))
                } else {
                    FwError::Io(e)
                }
            })?;

        // feed stdin while stdout/stderr drain
        let stdin = child.stdin.take();
        let feed = async move {
            if let (Some(payload), Some(mut stdin)) = (command.stdin.as_deref(), stdin) {
                stdin.write_all(payload.as_bytes()).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(command = %command, code = ?output.status.code(), %stderr, "nft failed");
            return Err(FwError::EngineRejected {
                command: command.to_string(),
                stderr,
                exit_code: output.status.code(),
            });
        }

        fed?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let engine = NftCli::with_binary("/nonexistent/nft-binary");
        assert!(!engine.available().await);

        let err = engine.execute(&NftCommand::list_tables()).await.unwrap_err();
        assert!(matches!(err, FwError::PrerequisiteMissing(_)));
    }

    #[tokio::test]
    async fn non_zero_exit_is_engine_rejected() {
        // `false` ignores its arguments and exits 1
        let engine = NftCli::with_binary("false");
        let err = engine.execute(&NftCommand::list_tables()).await.unwrap_err();
        match err {
            FwError::EngineRejected { command, exit_code, .. } => {
                assert_eq!(command, "nft list tables");
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn large_stdin_payload_does_not_block() {
        // `cat` echoes stdin, filling stdout while the payload is still being written
        let engine = NftCli::with_binary("cat");
        let payload = "add rule inet filter input drop\n".repeat(20_000);
        let cmd = NftCommand {
            args: vec![],
            stdin: Some(payload.clone()),
        };

        let out = engine.execute(&cmd).await.unwrap();
        assert_eq!(out.len(), payload.len());
    }

    #[tokio::test]
    async fn stdout_is_returned() {
        // `echo` stands in for nft to check argument passing
        let engine = NftCli::with_binary("echo");
        let out = engine.execute(&NftCommand::list_tables()).await.unwrap();
        assert_eq!(out.trim(), "list tables");
    }
}
