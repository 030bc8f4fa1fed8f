use nw_core::FwError;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Package managers probed in order, with the arguments that install nftables
const PACKAGE_MANAGERS: &[(&str, &[&str])] = &[
    ("apt-get", &["install", "-y", "nftables"]),
    ("dnf", &["install", "-y", "nftables"]),
    ("yum", &["install", "-y", "nftables"]),
    ("pacman", &["-S", "--noconfirm", "nftables"]),
    ("zypper", &["--non-interactive", "install", "nftables"]),
    ("apk", &["add", "nftables"]),
];

/// Side effects on the host outside the nft ruleset
#[allow(async_fn_in_trait)]
pub trait Host {
    /// Install the nftables package and enable its service
    async fn install_engine(&self) -> Result<(), FwError>;

    /// `net.ipv4.ip_forward = 1`
    async fn enable_ip_forwarding(&self) -> Result<(), FwError>;

    async fn ip_forwarding_enabled(&self) -> Result<bool, FwError>;
}

/// The machine we are running on
pub struct SystemHost {
    forward_path: PathBuf,
}

impl SystemHost {
    pub fn new() -> Self {
        Self {
            forward_path: PathBuf::from(IP_FORWARD_PATH),
        }
    }

    /// Point forwarding reads and writes at another file
    pub fn with_forward_path(path: impl Into<PathBuf>) -> Self {
        Self {
            forward_path: path.into(),
        }
    }

    async fn detect_package_manager(&self) -> Option<(&'static str, &'static [&'static str])> {
        for (manager, args) in PACKAGE_MANAGERS {
            if command_exists(manager).await {
                return Some((*manager, *args));
            }
        }
        None
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SystemHost {
    async fn install_engine(&self) -> Result<(), FwError> {
        let Some((manager, args)) = self.detect_package_manager().await else {
            return Err(FwError::PrerequisiteMissing(
                "nft is not installed and no supported package manager was found".to_string(),
            ));
        };

        info!(manager, "installing nftables");
        let status = Command::new(manager)
            .args(args)
            .stdout(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(FwError::PrerequisiteMissing(format!(
                "{} failed to install nftables (exit {:?})",
                manager,
                status.code()
            )));
        }

        // Not every distribution ships the unit; the package is what matters
        match Command::new("systemctl")
            .args(["enable", "--now", "nftables"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(s) if s.success() => info!("nftables service enabled"),
            Ok(s) => warn!(code = ?s.code(), "could not enable nftables service"),
            Err(e) => warn!(error = %e, "systemctl unavailable"),
        }

        Ok(())
    }

    async fn enable_ip_forwarding(&self) -> Result<(), FwError> {
        tokio::fs::write(&self.forward_path, "1\n").await?;
        info!("IPv4 forwarding enabled");
        Ok(())
    }

    async fn ip_forwarding_enabled(&self) -> Result<bool, FwError> {
        let value = tokio::fs::read_to_string(&self.forward_path).await?;
        Ok(value.trim() == "1")
    }
}

async fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwarding_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ip_forward");
        std::fs::write(&path, "0\n").unwrap();

        let host = SystemHost::with_forward_path(&path);
        assert!(!host.ip_forwarding_enabled().await.unwrap());

        host.enable_ip_forwarding().await.unwrap();
        assert!(host.ip_forwarding_enabled().await.unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1\n");
    }

    #[tokio::test]
    async fn missing_forward_file_is_an_error() {
        let host = SystemHost::with_forward_path("/nonexistent/ip_forward");
        assert!(host.ip_forwarding_enabled().await.is_err());
    }
}
