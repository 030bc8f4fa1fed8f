use crate::command::NftCommand;
use crate::engine::NftEngine;
use nw_core::FwError;
use similar::TextDiff;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Result of comparing a saved snapshot with the live ruleset
pub struct RulesetDiff {
    pub snapshot: PathBuf,
    pub matches: bool,
    pub diff: Option<String>,
}

impl RulesetDiff {
    pub fn display(&self) {
        if self.matches {
            println!("✅ Live ruleset matches {}", self.snapshot.display());
        } else if let Some(diff) = &self.diff {
            println!("🔀 Live ruleset differs from {}:", self.snapshot.display());
            print!("{}", diff);
        }
    }
}

/// Ruleset backups as plain `nft list ruleset` text files
pub struct SnapshotManager {
    backup_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Write the live ruleset to `ruleset-<unix seconds>.nft` and return its path
    pub async fn backup(&self, engine: &impl NftEngine) -> Result<PathBuf, FwError> {
        let ruleset = engine.execute(&NftCommand::list_ruleset(false)).await?;

        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let path = self.next_backup_path();
        tokio::fs::write(&path, ruleset).await?;

        info!(path = %path.display(), "ruleset backed up");
        Ok(path)
    }

    /// Re-submit a snapshot verbatim through `nft -f -`.
    ///
    /// Without `flush`, objects already present are merged with the snapshot.
    /// With it, `flush ruleset` heads the same load so nft swaps the ruleset
    /// in one transaction. The snapshot is read before the engine is touched.
    pub async fn restore(&self, engine: &impl NftEngine, snapshot: &Path, flush: bool) -> Result<(), FwError> {
        let ruleset = read_snapshot(snapshot).await?;

        let payload = if flush {
            format!("flush ruleset\n{}", ruleset)
        } else {
            ruleset
        };
        engine.execute(&NftCommand::load(payload)).await?;

        info!(path = %snapshot.display(), flush, "ruleset restored");
        Ok(())
    }

    /// Line diff from the snapshot to the live ruleset
    pub async fn diff(&self, engine: &impl NftEngine, snapshot: &Path) -> Result<RulesetDiff, FwError> {
        let saved = read_snapshot(snapshot).await?;
        let live = engine.execute(&NftCommand::list_ruleset(false)).await?;

        let matches = saved == live;
        Ok(RulesetDiff {
            snapshot: snapshot.to_path_buf(),
            matches,
            diff: (!matches).then(|| render_diff(&saved, &live)),
        })
    }

    /// Saved snapshots, oldest first
    pub async fn list(&self) -> Result<Vec<PathBuf>, FwError> {
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("nft") {
                snapshots.push(path);
            }
        }
        snapshots.sort();
        Ok(snapshots)
    }

    fn next_backup_path(&self) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let mut path = self.backup_dir.join(format!("ruleset-{}.nft", stamp));
        let mut n = 1;
        while path.exists() {
            path = self.backup_dir.join(format!("ruleset-{}-{}.nft", stamp, n));
            n += 1;
        }
        path
    }
}

async fn read_snapshot(path: &Path) -> Result<String, FwError> {
    match tokio::fs::read_to_string(path).await {
        Ok(ruleset) => Ok(ruleset),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FwError::PrerequisiteMissing(
            format!("snapshot {} does not exist", path.display()),
        )),
        Err(e) => Err(e.into()),
    }
}

fn render_diff(saved: &str, live: &str) -> String {
    TextDiff::from_lines(saved, live)
        .unified_diff()
        .context_radius(3)
        .header("snapshot", "live")
        .to_string()
}
