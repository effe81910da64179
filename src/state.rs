use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelCursor {
    /// Newest message id seen by the incremental scan.
    pub after: Option<String>,
    /// Oldest message id reached by the backfill.
    pub before: Option<String>,
    pub history_complete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanState {
    pub channels: BTreeMap<String, ChannelCursor>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl ScanState {
    pub fn load(path: &Path) -> Self {
        let mut state = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<ScanState>(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "scan state is corrupt; starting fresh");
                ScanState::default()
            }),
            Err(_) => ScanState::default(),
        };
        state.path = Some(path.to_path_buf());
        state
    }

    pub fn cursor(&self, channel_id: &str) -> ChannelCursor {
        self.channels.get(channel_id).cloned().unwrap_or_default()
    }

    pub fn cursor_mut(&mut self, channel_id: &str) -> &mut ChannelCursor {
        self.channels.entry(channel_id.to_string()).or_default()
    }

    pub fn reset(&mut self, channel_id: &str) -> bool {
        self.channels.remove(channel_id).is_some()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, format!("{json}\n"))?;
        Ok(())
    }
}
