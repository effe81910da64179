use crate::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// File-backed set of `"{message_id}-{attachment_id}"` keys already downloaded.
#[derive(Debug, Clone)]
pub struct DownloadLedger {
    path: PathBuf,
    keys: HashSet<String>,
}

impl DownloadLedger {
    /// A missing or unreadable ledger starts empty.
    pub fn load(path: &Path) -> Self {
        let keys = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(list) => list.into_iter().collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "download ledger is corrupt; starting fresh");
                    HashSet::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "download ledger unreadable; starting fresh");
                HashSet::new()
            }
        };
        Self {
            path: path.to_path_buf(),
            keys,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn insert(&mut self, key: impl Into<String>) -> bool {
        self.keys.insert(key.into())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut sorted: Vec<&String> = self.keys.iter().collect();
        sorted.sort();
        let json = serde_json::to_string_pretty(&sorted)?;
        std::fs::write(&self.path, format!("{json}\n"))?;
        Ok(())
    }

    pub fn ensure_file(path: &Path) -> Result<()> {
        if path.exists() {
            return Ok(());
        }
        Self::load(path).save()
    }
}
