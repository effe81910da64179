use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

const CURRENT_SCHEMA_VERSION: i64 = 2;

/// Columns added after the first release, backfilled onto older stores.
const LATE_COLUMNS: &[(&str, &str)] = &[
    ("category", "TEXT"),
    ("sha256", "TEXT"),
    ("size_bytes", "INTEGER"),
    ("created_at_ms", "INTEGER"),
];

pub fn open(download_dir: &Path) -> Result<Connection> {
    let db_path = AppPaths::db_path(download_dir);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;

    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;

    Ok(conn)
}

pub fn exists(download_dir: &Path) -> bool {
    AppPaths::db_path(download_dir).exists()
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS videos (
  download_filename TEXT PRIMARY KEY,
  message_id TEXT,
  channel_id TEXT,
  author_id TEXT,
  author_name TEXT,
  timestamp TEXT,
  prompt TEXT,
  attachment_json TEXT,
  discord_message_url TEXT
);
"#,
    )?;

    let existing = column_names(conn, "videos")?;
    for (name, ty) in LATE_COLUMNS {
        if !existing.iter().any(|c| c == name) {
            conn.execute(&format!("ALTER TABLE videos ADD COLUMN {name} {ty}"), [])?;
        }
    }

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_videos_timestamp ON videos(timestamp)",
        [],
    )?;
    conn.execute(
        "INSERT INTO meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [CURRENT_SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn ensure_schema(download_dir: &Path) -> Result<()> {
    let conn = open(download_dir)?;
    migrate(&conn)?;
    Ok(())
}

fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    let mut names = Vec::new();
    while let Some(row) = rows.next()? {
        names.push(row.get::<_, String>(1)?);
    }
    Ok(names)
}
