use crate::db;
use crate::discord::{self, Attachment, Message};
use crate::status::now_ms;
use crate::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One downloaded video as stored in the metadata database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub download_filename: String,
    pub message_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author_name: String,
    pub timestamp: Option<String>,
    pub prompt: String,
    pub attachment_json: String,
    pub discord_message_url: String,
    pub category: Option<String>,
    pub sha256: Option<String>,
    pub size_bytes: Option<i64>,
    pub created_at_ms: Option<i64>,
}

pub fn build_record(
    attachment: &Attachment,
    message: &Message,
    download_filename: &str,
    channel_id: &str,
) -> Result<VideoRecord> {
    Ok(VideoRecord {
        download_filename: download_filename.to_string(),
        message_id: message.id.clone(),
        channel_id: channel_id.to_string(),
        author_id: message.author.id.clone(),
        author_name: message.author.username.clone(),
        timestamp: message.timestamp.clone(),
        prompt: message.content.clone(),
        attachment_json: serde_json::to_string(attachment)?,
        discord_message_url: discord::message_link(
            message.guild_id.as_deref(),
            channel_id,
            &message.id,
        ),
        category: None,
        sha256: None,
        size_bytes: None,
        created_at_ms: Some(now_ms()),
    })
}

pub fn save_record(download_dir: &Path, record: &VideoRecord) -> Result<()> {
    let conn = db::open(download_dir)?;
    db::migrate(&conn)?;
    conn.execute(
        r#"
INSERT OR REPLACE INTO videos (
  download_filename,
  message_id,
  channel_id,
  author_id,
  author_name,
  timestamp,
  prompt,
  attachment_json,
  discord_message_url,
  category,
  sha256,
  size_bytes,
  created_at_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
"#,
        params![
            &record.download_filename,
            &record.message_id,
            &record.channel_id,
            &record.author_id,
            &record.author_name,
            &record.timestamp,
            &record.prompt,
            &record.attachment_json,
            &record.discord_message_url,
            &record.category,
            &record.sha256,
            record.size_bytes,
            record.created_at_ms,
        ],
    )?;
    Ok(())
}

/// Every record, newest message first.
pub fn list_records(download_dir: &Path) -> Result<Vec<VideoRecord>> {
    let conn = db::open(download_dir)?;
    db::migrate(&conn)?;

    let mut stmt = conn.prepare(
        r#"
SELECT
  download_filename,
  message_id,
  channel_id,
  author_id,
  author_name,
  timestamp,
  prompt,
  attachment_json,
  discord_message_url,
  category,
  sha256,
  size_bytes,
  created_at_ms
FROM videos
ORDER BY timestamp DESC
"#,
    )?;

    let rows = stmt
        .query_map([], row_to_record)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn count_records(download_dir: &Path) -> Result<usize> {
    let conn = db::open(download_dir)?;
    db::migrate(&conn)?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM videos", [], |row| row.get(0))?;
    Ok(count.max(0) as usize)
}

pub fn set_category(download_dir: &Path, download_filename: &str, category: Option<&str>) -> Result<bool> {
    let conn = db::open(download_dir)?;
    db::migrate(&conn)?;
    let changed = conn.execute(
        "UPDATE videos SET category = ?1 WHERE download_filename = ?2",
        params![category, download_filename],
    )?;
    Ok(changed > 0)
}

pub fn export_csv(download_dir: &Path, out_path: &Path) -> Result<usize> {
    let records = list_records(download_dir)?;
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(out_path)?;
    for record in &records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(records.len())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<VideoRecord> {
    let text = |idx: usize| -> rusqlite::Result<String> {
        Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
    };
    Ok(VideoRecord {
        download_filename: row.get(0)?,
        message_id: text(1)?,
        channel_id: text(2)?,
        author_id: text(3)?,
        author_name: text(4)?,
        timestamp: row.get(5)?,
        prompt: text(6)?,
        attachment_json: text(7)?,
        discord_message_url: text(8)?,
        category: row.get(9)?,
        sha256: row.get(10)?,
        size_bytes: row.get(11)?,
        created_at_ms: row.get(12)?,
    })
}
