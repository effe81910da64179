use crate::Result;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, info};

const PROXY_FILE_HEADER: &str = "\
# One proxy per line. Lines starting with '#' are ignored.
# Entries without a scheme are treated as http://host:port.
";

fn scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?i)(https?|socks5h?|socks4)://").expect("static regex"))
}

/// Returns `None` for blank lines and comments.
pub fn normalize_proxy(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    if scheme_re().is_match(trimmed) {
        Some(trimmed.to_string())
    } else {
        Some(format!("http://{trimmed}"))
    }
}

pub fn parse_proxy_list(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for proxy in text.lines().filter_map(normalize_proxy) {
        if !out.contains(&proxy) {
            out.push(proxy);
        }
    }
    out
}

pub fn load_proxies(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        info!(path = %path.display(), "proxy file not found; no proxies loaded");
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(path)?;
    let proxies = parse_proxy_list(&text);
    info!(count = proxies.len(), path = %path.display(), "loaded proxies");
    Ok(proxies)
}

pub fn save_proxies(path: &Path, proxies: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = String::from(PROXY_FILE_HEADER);
    for proxy in proxies {
        body.push_str(proxy);
        body.push('\n');
    }
    std::fs::write(path, body)?;
    debug!(count = proxies.len(), path = %path.display(), "saved proxies");
    Ok(())
}

pub fn ensure_proxy_file(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    save_proxies(path, &[])
}
