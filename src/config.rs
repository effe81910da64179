use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TOKEN_ENV_VAR: &str = "DISCORD_USER_TOKEN";
const DEFAULT_API_BASE: &str = "https://discord.com/api/v9";
const MAX_MESSAGES_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Poll for new messages and walk the channel history backwards.
    FullScan,
    /// Poll for new messages only.
    NewOnly,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullScan => "full_scan",
            Self::NewOnly => "new_only",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "full" | "full_scan" => Some(Self::FullScan),
            "new" | "new_only" => Some(Self::NewOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,
    pub mode: ScanMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub api_base: String,
    pub messages_limit: u32,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub retry_after_default_secs: u64,
    pub max_retry_after_secs: u64,
    pub max_rate_limit_retries: u32,
    pub cycle_sleep_secs: u64,
    pub cycle_jitter_secs: u64,
    pub channel_delay_min_secs: u64,
    pub channel_delay_max_secs: u64,
    pub polite_delay_min_secs: u64,
    pub polite_delay_max_secs: u64,
    pub pause_poll_secs: u64,
    pub max_soft_failures: u32,
    pub videos_per_page: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            messages_limit: MAX_MESSAGES_LIMIT,
            request_timeout_secs: 10,
            download_timeout_secs: 1800,
            retry_after_default_secs: 5,
            max_retry_after_secs: 300,
            max_rate_limit_retries: 3,
            cycle_sleep_secs: 300,
            cycle_jitter_secs: 60,
            channel_delay_min_secs: 5,
            channel_delay_max_secs: 15,
            polite_delay_min_secs: 1,
            polite_delay_max_secs: 3,
            pause_poll_secs: 2,
            max_soft_failures: 5,
            videos_per_page: 100,
        }
    }
}

impl Tuning {
    pub fn messages_limit(&self) -> u32 {
        self.messages_limit.clamp(1, MAX_MESSAGES_LIMIT)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs.max(1))
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }

    pub fn videos_per_page(&self) -> usize {
        self.videos_per_page.max(1)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_dir: Option<String>,
    pub channels: Vec<ChannelConfig>,
    pub use_proxies: bool,
    pub tuning: Tuning,
}

impl Settings {
    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<Settings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = std::fs::read(&path)?;
    serde_json::from_slice(&bytes).map_err(|e| EngineError::SettingsInvalid {
        path: path.clone(),
        reason: e.to_string(),
    })
}

pub fn save_settings(paths: &AppPaths, settings: &Settings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

/// Inserts the channel or updates the name and mode of an existing entry.
pub fn upsert_channel(
    settings: &mut Settings,
    id: &str,
    name: Option<&str>,
    mode: ScanMode,
) -> Result<ChannelConfig> {
    let id = normalize_channel_id(id)?;
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    if let Some(existing) = settings.channels.iter_mut().find(|c| c.id == id) {
        if let Some(name) = name {
            existing.name = name;
        }
        existing.mode = mode;
        return Ok(existing.clone());
    }

    let channel = ChannelConfig {
        name: name.unwrap_or_else(|| id.clone()),
        id,
        mode,
    };
    settings.channels.push(channel.clone());
    Ok(channel)
}

pub fn remove_channel(settings: &mut Settings, id: &str) -> bool {
    let id = id.trim();
    let before = settings.channels.len();
    settings.channels.retain(|c| c.id != id);
    settings.channels.len() != before
}

pub fn normalize_channel_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(EngineError::InvalidInput(format!(
            "channel id must be a numeric snowflake, got {raw:?}"
        )));
    }
    Ok(trimmed.to_string())
}

pub fn effective_download_dir(paths: &AppPaths, settings: &Settings) -> PathBuf {
    match settings.download_dir.as_deref().map(str::trim) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => paths.default_download_dir(),
    }
}

pub fn resolve_token(paths: &AppPaths) -> Result<Option<String>> {
    if let Ok(value) = std::env::var(TOKEN_ENV_VAR) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
    read_token_file(&paths.token_path())
}

pub fn save_token(paths: &AppPaths, token: &str) -> Result<()> {
    write_secret_token(&paths.token_path(), token)
}

pub fn clear_token(paths: &AppPaths) -> Result<()> {
    let token_path = paths.token_path();
    if token_path.exists() {
        std::fs::remove_file(token_path)?;
    }
    Ok(())
}

pub fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{prefix}…")
}

fn read_token_file(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(trimmed.to_string()))
}

fn write_secret_token(path: &Path, token: &str) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        return Err(EngineError::InvalidInput("token is empty".to_string()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{token}\n"))?;
    Ok(())
}
