use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    pub fn token_path(&self) -> PathBuf {
        self.config_dir().join("token.txt")
    }

    pub fn proxies_path(&self) -> PathBuf {
        self.config_dir().join("proxies.txt")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join("state")
    }

    pub fn scan_state_path(&self) -> PathBuf {
        self.state_dir().join("scan_state.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir().join("downloaded_attachments.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    pub fn activity_log_path(&self) -> PathBuf {
        self.logs_dir().join("activity.jsonl")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ffprobe_bin_path(&self) -> PathBuf {
        let mut path = self.ffmpeg_dir().join("ffprobe");
        if cfg!(windows) {
            path.set_extension("exe");
        }
        path
    }

    pub fn ffprobe_cmd(&self) -> PathBuf {
        let path = self.ffprobe_bin_path();
        if path.exists() {
            path
        } else {
            PathBuf::from("ffprobe")
        }
    }

    pub fn default_download_dir(&self) -> PathBuf {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(parent) = exe_path.parent() {
                return parent.join("downloads");
            }
        }
        self.base_dir.join("downloads")
    }

    /// Metadata store lives next to the videos it describes.
    pub fn db_path(download_dir: &Path) -> PathBuf {
        download_dir.join("sql_database").join("metadata.db")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.state_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
