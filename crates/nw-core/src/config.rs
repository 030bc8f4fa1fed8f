use crate::error::FwError;
use crate::model::{Family, TableRef, Target};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nftwarden/config.yaml";

/// Runtime settings, read from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub defaults: TargetDefaults,
    pub nat: NatDefaults,
    pub lists: ListPaths,
    pub backup_dir: PathBuf,
    pub nft_binary: String,
    /// tracing filter used when RUST_LOG is unset
    pub log_level: String,
    pub log_rules: LogRuleDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetDefaults {
    pub family: Family,
    pub table: String,
    pub chain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NatDefaults {
    pub family: Family,
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListPaths {
    pub blacklist: PathBuf,
    pub whitelist: PathBuf,
    /// Chains the mirrored list rules are written into
    pub input_chain: String,
    pub output_chain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogRuleDefaults {
    /// Severity attached to `log` rules
    pub level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            defaults: TargetDefaults::default(),
            nat: NatDefaults::default(),
            lists: ListPaths::default(),
            backup_dir: PathBuf::from("/var/backups/nftwarden"),
            nft_binary: "nft".to_string(),
            log_level: "info".to_string(),
            log_rules: LogRuleDefaults::default(),
        }
    }
}

impl Default for TargetDefaults {
    fn default() -> Self {
        Self {
            family: Family::Inet,
            table: "filter".to_string(),
            chain: "input".to_string(),
        }
    }
}

impl Default for NatDefaults {
    fn default() -> Self {
        Self {
            family: Family::Ip,
            table: "nat".to_string(),
        }
    }
}

impl Default for ListPaths {
    fn default() -> Self {
        Self {
            blacklist: PathBuf::from("/etc/nftwarden/blacklist.txt"),
            whitelist: PathBuf::from("/etc/nftwarden/whitelist.txt"),
            input_chain: "input".to_string(),
            output_chain: "output".to_string(),
        }
    }
}

impl Default for LogRuleDefaults {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn from_yaml(yaml: &str) -> Result<Self, FwError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, FwError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Explicit path must exist; otherwise fall back to the system file, then defaults
    pub fn load(path: Option<&Path>) -> Result<Self, FwError> {
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(FwError::PrerequisiteMissing(format!(
                        "config file {} does not exist",
                        path.display()
                    )));
                }
                Self::from_file(path)
            }
            None => {
                let system = Path::new(DEFAULT_CONFIG_PATH);
                if system.exists() {
                    Self::from_file(system)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Default target with per-invocation overrides applied
    pub fn target(&self, family: Option<Family>, table: Option<&str>, chain: Option<&str>) -> Target {
        Target::new(
            family.unwrap_or(self.defaults.family),
            table.unwrap_or(&self.defaults.table),
            chain.unwrap_or(&self.defaults.chain),
        )
    }

    pub fn table(&self, family: Option<Family>, table: Option<&str>) -> TableRef {
        TableRef::new(
            family.unwrap_or(self.defaults.family),
            table.unwrap_or(&self.defaults.table),
        )
    }

    pub fn nat_table(&self) -> TableRef {
        TableRef::new(self.nat.family, self.nat.table.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let settings = Settings::from_yaml("{}").unwrap();
        assert_eq!(settings.defaults.family, Family::Inet);
        assert_eq!(settings.defaults.table, "filter");
        assert_eq!(settings.defaults.chain, "input");
        assert_eq!(settings.nat_table(), TableRef::new(Family::Ip, "nat"));
        assert_eq!(settings.nft_binary, "nft");
    }

    #[test]
    fn partial_yaml_overrides_only_given_fields() {
        let yaml = r#"
defaults:
  table: fw
lists:
  blacklist: /tmp/bl.txt
log_level: debug
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.defaults.table, "fw");
        assert_eq!(settings.defaults.chain, "input");
        assert_eq!(settings.lists.blacklist, PathBuf::from("/tmp/bl.txt"));
        assert_eq!(settings.lists.whitelist, PathBuf::from("/etc/nftwarden/whitelist.txt"));
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Settings::from_yaml("nft_path: /sbin/nft").is_err());
    }

    #[test]
    fn overrides_apply_to_target() {
        let settings = Settings::default();
        let target = settings.target(Some(Family::Ip6), None, Some("forward"));
        assert_eq!(target, Target::new(Family::Ip6, "filter", "forward"));
    }

    #[test]
    fn missing_explicit_config_is_a_prerequisite_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/nftwarden.yaml"))).unwrap_err();
        assert!(matches!(err, FwError::PrerequisiteMissing(_)));
    }
}
