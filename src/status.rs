use crate::paths::AppPaths;
use crate::Result;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACTIVITY_LOG_ROTATE_BYTES: u64 = 10 * 1024 * 1024;
const ACTIVITY_LOG_MAX_BACKUPS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub status: String,
    pub downloaded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

impl StatusLevel {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Fans worker progress out to the log, an optional listener and the activity journal.
#[derive(Debug)]
pub struct StatusSink {
    run_id: String,
    journal: Option<PathBuf>,
    listener: Mutex<Option<Sender<StatusUpdate>>>,
    downloaded: AtomicUsize,
}

impl StatusSink {
    pub fn new(paths: Option<&AppPaths>) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            journal: paths.map(AppPaths::activity_log_path),
            listener: Mutex::new(None),
            downloaded: AtomicUsize::new(0),
        }
    }

    pub fn with_listener(self, sender: Sender<StatusUpdate>) -> Self {
        if let Ok(mut guard) = self.listener.lock() {
            *guard = Some(sender);
        }
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn set_downloaded(&self, count: usize) {
        self.downloaded.store(count, Ordering::SeqCst);
    }

    pub fn downloaded(&self) -> usize {
        self.downloaded.load(Ordering::SeqCst)
    }

    pub fn info(&self, status: impl Into<String>) {
        self.report(StatusLevel::Info, status.into());
    }

    pub fn warn(&self, status: impl Into<String>) {
        self.report(StatusLevel::Warn, status.into());
    }

    pub fn error(&self, status: impl Into<String>) {
        self.report(StatusLevel::Error, status.into());
    }

    pub fn report(&self, level: StatusLevel, status: String) {
        let downloaded = self.downloaded();
        match level {
            StatusLevel::Info => info!(downloaded, "{status}"),
            StatusLevel::Warn => warn!(downloaded, "{status}"),
            StatusLevel::Error => error!(downloaded, "{status}"),
        }

        if let Some(path) = self.journal.as_deref() {
            if let Err(e) = append_journal_line(path, &self.run_id, level, &status, downloaded) {
                debug!(error = %e, "failed to append activity journal");
            }
        }

        let update = StatusUpdate { status, downloaded };
        if let Ok(mut guard) = self.listener.lock() {
            let gone = match guard.as_ref() {
                Some(sender) => sender.send(update).is_err(),
                None => false,
            };
            if gone {
                *guard = None;
            }
        }
    }
}

fn append_journal_line(
    path: &Path,
    run_id: &str,
    level: StatusLevel,
    status: &str,
    downloaded: usize,
) -> Result<()> {
    let line = serde_json::json!({
        "ts_ms": now_ms(),
        "run_id": run_id,
        "level": level.as_str(),
        "event": "status",
        "data": { "status": status, "downloaded": downloaded }
    })
    .to_string();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    rotate_journal(path, ACTIVITY_LOG_ROTATE_BYTES, ACTIVITY_LOG_MAX_BACKUPS)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(format!("{line}\n").as_bytes())?;
    Ok(())
}

/// Shifts `activity.jsonl` to `.1`, `.1` to `.2` and so on once it reaches
/// `max_bytes`; the oldest backup beyond `keep` is dropped.
fn rotate_journal(path: &Path, max_bytes: u64, keep: usize) -> std::io::Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() >= max_bytes => {}
        _ => return Ok(()),
    }
    if keep == 0 {
        return std::fs::remove_file(path);
    }

    let oldest = backup_path(path, keep);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for n in (1..keep).rev() {
        let from = backup_path(path, n);
        if from.exists() {
            std::fs::rename(&from, backup_path(path, n + 1))?;
        }
    }
    std::fs::rename(path, backup_path(path, 1))
}

fn backup_path(path: &Path, n: usize) -> PathBuf {
    let mut name = path.file_name().map(|f| f.to_os_string()).unwrap_or_default();
    name.push(format!(".{n}"));
    path.with_file_name(name)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
