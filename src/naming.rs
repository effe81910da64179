use chrono::{DateTime, Local};
use rand::Rng;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

const MAX_TITLE_CHARS: usize = 70;
const DEFAULT_EXTENSION: &str = ".mp4";

fn markdown_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[*_`~>|]").expect("static regex"))
}

fn disallowed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\w\s.-]").expect("static regex"))
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

fn slugify(raw: &str) -> String {
    let kept = disallowed_re().replace_all(raw, "");
    let joined = whitespace_re().replace_all(&kept, "_");
    joined.trim_matches('_').to_string()
}

fn title_from_content(content: &str) -> String {
    let first_line = content.split('\n').next().unwrap_or_default();
    let unmarked = markdown_re().replace_all(first_line, "");
    let slug = slugify(unmarked.trim());
    if slug.is_empty() {
        "no_title_content".to_string()
    } else {
        slug.chars().take(MAX_TITLE_CHARS).collect()
    }
}

fn title_from_filename(original: &str) -> String {
    let stem = Path::new(original)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let slug = slugify(stem);
    if slug.is_empty() {
        "unnamed_file".to_string()
    } else {
        slug
    }
}

fn extension_of(original: &str) -> String {
    Path::new(original)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{e}"))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// Builds `{title}_{YYYYmmdd_HHMMSS}_{suffix}{ext}` from the message text,
/// falling back to the attachment's own name when the message has no text.
pub fn clean_filename(
    original_filename: &str,
    message_content: &str,
    now: DateTime<Local>,
    suffix: u16,
) -> String {
    let title = if message_content.is_empty() {
        title_from_filename(original_filename)
    } else {
        title_from_content(message_content)
    };
    format!(
        "{title}_{}_{suffix}{}",
        now.format("%Y%m%d_%H%M%S"),
        extension_of(original_filename)
    )
}

pub fn generate_filename(original_filename: &str, message_content: &str) -> String {
    let suffix = rand::rng().random_range(1000..=9999);
    clean_filename(original_filename, message_content, Local::now(), suffix)
}

/// Human-readable card title: stem with underscores spaced out, title-cased.
pub fn display_title(filename: &str) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    title_case(&stem.replace('_', " "))
}

fn title_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_cased = false;
    for ch in input.chars() {
        let cased = ch.is_lowercase() || ch.is_uppercase();
        if cased {
            if prev_cased {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
        } else {
            out.push(ch);
        }
        prev_cased = cased;
    }
    out
}
