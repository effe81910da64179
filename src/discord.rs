use crate::control::Control;
use crate::http::{HttpRequest, Transport};
use crate::proxy_pool::ProxyPool;
use crate::status::StatusSink;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;
use url::Url;

const MAX_MESSAGES_BODY_BYTES: u64 = 16 * 1024 * 1024;
const MESSAGE_LINK_BASE: &str = "https://discord.com/channels";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    /// Remaining fields, kept so the stored attachment JSON is complete.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Attachment {
    pub fn is_video(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.trim().to_ascii_lowercase().starts_with("video/"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub guild_id: Option<String>,
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Latest,
    After(String),
    Before(String),
}

pub fn attachment_key(message: &Message, attachment: &Attachment) -> String {
    format!("{}-{}", message.id, attachment.id)
}

pub fn message_link(guild_id: Option<&str>, channel_id: &str, message_id: &str) -> String {
    let scope = guild_id
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .unwrap_or("@me");
    format!("{MESSAGE_LINK_BASE}/{scope}/{channel_id}/{message_id}")
}

pub fn messages_url(api_base: &str, channel_id: &str, cursor: &Cursor, limit: u32) -> Result<String> {
    let base = api_base.trim().trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/channels/{channel_id}/messages"))
        .map_err(|e| EngineError::InvalidInput(format!("invalid api base {api_base:?}: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("limit", &limit.to_string());
        match cursor {
            Cursor::Latest => {}
            Cursor::After(id) => {
                query.append_pair("after", id);
            }
            Cursor::Before(id) => {
                query.append_pair("before", id);
            }
        }
    }
    Ok(url.to_string())
}

/// Fetches one page of messages, newest first as the API returns them.
pub fn fetch_messages(
    pool: &mut ProxyPool,
    transport: &dyn Transport,
    control: &Control,
    status: &StatusSink,
    token: &str,
    url: &str,
    timeout: Duration,
) -> Result<Vec<Message>> {
    let request = HttpRequest::get(url, timeout)
        .header("Authorization", token)
        .header("Accept", "application/json");
    let response = pool.fetch(transport, &request, control, status)?;

    let mut body = String::new();
    response
        .body
        .take(MAX_MESSAGES_BODY_BYTES)
        .read_to_string(&mut body)?;
    parse_messages(&body)
}

pub fn parse_messages(body: &str) -> Result<Vec<Message>> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"[
      {
        "id": "1002",
        "channel_id": "77",
        "guild_id": "5",
        "author": { "id": "9", "username": "maker", "avatar": null },
        "content": "**A cat** on a skateboard\nsecond line",
        "timestamp": "2025-06-01T10:00:00.000000+00:00",
        "attachments": [
          { "id": "a1", "filename": "cat.mp4", "url": "https://cdn.example/cat.mp4",
            "content_type": "video/mp4", "size": 1234, "width": 640 },
          { "id": "a2", "filename": "still.png", "url": "https://cdn.example/still.png",
            "content_type": "image/png" }
        ]
      },
      { "id": "1001", "author": { "id": "9", "username": "maker" }, "content": "" }
    ]"#;

    #[test]
    fn parses_page_and_keeps_extra_attachment_fields() {
        let messages = parse_messages(PAGE).expect("parse");
        assert_eq!(messages.len(), 2);
        let first = &messages[0];
        assert!(first.attachments[0].is_video());
        assert!(!first.attachments[1].is_video());
        assert_eq!(attachment_key(first, &first.attachments[0]), "1002-a1");

        let raw = serde_json::to_value(&first.attachments[0]).expect("to json");
        assert_eq!(raw["width"], 640);
        assert_eq!(raw["content_type"], "video/mp4");

        assert!(messages[1].attachments.is_empty());
        assert!(messages[1].guild_id.is_none());
        assert!(parse_messages("  ").expect("empty").is_empty());
    }

    #[test]
    fn message_link_uses_guild_or_dm_scope() {
        assert_eq!(
            message_link(Some("5"), "77", "1002"),
            "https://discord.com/channels/5/77/1002"
        );
        assert_eq!(
            message_link(None, "77", "1002"),
            "https://discord.com/channels/@me/77/1002"
        );
    }

    #[test]
    fn messages_url_carries_cursor() {
        let base = "https://discord.com/api/v9/";
        assert_eq!(
            messages_url(base, "77", &Cursor::Latest, 100).expect("url"),
            "https://discord.com/api/v9/channels/77/messages?limit=100"
        );
        assert_eq!(
            messages_url(base, "77", &Cursor::After("1002".into()), 50).expect("url"),
            "https://discord.com/api/v9/channels/77/messages?limit=50&after=1002"
        );
        assert_eq!(
            messages_url(base, "77", &Cursor::Before("1001".into()), 100).expect("url"),
            "https://discord.com/api/v9/channels/77/messages?limit=100&before=1001"
        );
        assert!(messages_url("not a url", "77", &Cursor::Latest, 100).is_err());
    }
}
