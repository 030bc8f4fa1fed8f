use nw_core::{Address, FwError};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Backing store of a named address list
pub trait ListStore {
    fn read(&self) -> Result<Vec<Address>, FwError>;

    fn append(&self, address: &Address) -> Result<(), FwError>;

    /// Replace the whole list
    fn rewrite(&self, addresses: &[Address]) -> Result<(), FwError>;

    fn contains(&self, address: &Address) -> Result<bool, FwError> {
        Ok(self.read()?.contains(address))
    }
}

/// One address per line; blank lines and `#` comments are skipped
pub struct FileListStore {
    path: PathBuf,
}

impl FileListStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> Result<(), FwError> {
        if let Some(parent) = self.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn parent(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

impl ListStore for FileListStore {
    fn read(&self) -> Result<Vec<Address>, FwError> {
        if !self.path.exists() {
            return Ok(vec![]);
        }

        let content = std::fs::read_to_string(&self.path)?;
        let mut addresses = vec![];

        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.parse::<Address>() {
                Ok(address) => addresses.push(address),
                Err(_) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    entry = line,
                    "skipping malformed list entry"
                ),
            }
        }

        Ok(addresses)
    }

    fn append(&self, address: &Address) -> Result<(), FwError> {
        self.ensure_parent()?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", address)?;
        Ok(())
    }

    fn rewrite(&self, addresses: &[Address]) -> Result<(), FwError> {
        self.ensure_parent()?;

        let dir = self.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        for address in addresses {
            writeln!(tmp, "{}", address)?;
        }
        tmp.persist(&self.path).map_err(|e| FwError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileListStore::new(dir.path().join("blacklist.txt"));
        assert!(store.read().unwrap().is_empty());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whitelist.txt");
        std::fs::write(&path, "# office\n10.0.0.1\n\n  192.168.0.0/16  \nnot-an-ip\n").unwrap();

        let store = FileListStore::new(&path);
        let entries: Vec<String> = store.read().unwrap().iter().map(ToString::to_string).collect();
        assert_eq!(entries, vec!["10.0.0.1", "192.168.0.0/16"]);
    }

    #[test]
    fn append_creates_parent_and_rewrite_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileListStore::new(dir.path().join("lists").join("blacklist.txt"));
        let a: Address = "203.0.113.7".parse().unwrap();
        let b: Address = "198.51.100.0/24".parse().unwrap();

        store.append(&a).unwrap();
        store.append(&b).unwrap();
        assert!(store.contains(&a).unwrap());

        store.rewrite(&[b]).unwrap();
        assert_eq!(
            std::fs::read_to_string(store.path()).unwrap(),
            "198.51.100.0/24\n"
        );
        assert!(!store.contains(&a).unwrap());
    }
}
