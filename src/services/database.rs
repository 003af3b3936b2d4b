use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

use super::store::ChatStore;
use crate::models::{Conversation, ConversationPatch, Message};

#[derive(Debug, Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::db_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&path)
                .with_context(|| format!("Failed to open database at {}", path.display()))?;
            conn.execute_batch("PRAGMA journal_mode=WAL;")?;
            Ok(conn)
        })
        .await??;

        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Create an in-memory database (used for testing)
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn db_path() -> Result<PathBuf> {
        let data_dir = match std::env::var("XDG_DATA_HOME") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => {
                let home = std::env::var("HOME").context("Neither XDG_DATA_HOME nor HOME is set")?;
                PathBuf::from(home).join(".local/share")
            }
        };
        Ok(data_dir.join("lannzai").join("lannzai.db"))
    }

    fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
        conn.lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = Self::lock(&self.conn)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            );",
        )?;

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE chats (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    messages TEXT NOT NULL DEFAULT '[]',
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX idx_chats_updated ON chats(updated_at DESC);

                CREATE TABLE settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                INSERT INTO schema_version (version) VALUES (1);",
            )?;
        }

        Ok(())
    }

    // --- Key-value entries ---

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let result: Option<String> = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(result)
        })
        .await?
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )?;
            Ok(())
        })
        .await?
    }

    // --- Row helpers ---

    fn timestamp(at: &DateTime<Utc>) -> String {
        // Fixed width so lexical order matches chronological order.
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn row_to_conversation(row: &rusqlite::Row) -> Result<Conversation> {
        let messages_json: String = row.get(2)?;
        let updated_str: String = row.get(3)?;

        let messages: Vec<Message> = serde_json::from_str(&messages_json)
            .context("Stored messages are not a valid message array")?;

        Ok(Conversation {
            id: row.get(0)?,
            title: row.get(1)?,
            messages,
            updated_at: DateTime::parse_from_rfc3339(&updated_str)?.with_timezone(&Utc),
        })
    }
}

#[async_trait]
impl ChatStore for Database {
    async fn upsert(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn.clone();
        let id = conversation.id.clone();
        let title = conversation.title.clone();
        let messages = serde_json::to_string(&conversation.messages)?;
        let updated_at = Self::timestamp(&conversation.updated_at);
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            conn.execute(
                "INSERT INTO chats (id, title, messages, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET title = ?2, messages = ?3, updated_at = ?4",
                params![id, title, messages, updated_at],
            )?;
            Ok(())
        })
        .await?
    }

    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            conn.query_row(
                "SELECT id, title, messages, updated_at FROM chats WHERE id = ?1",
                params![id],
                |row| Ok(Self::row_to_conversation(row)),
            )
            .optional()?
            .transpose()
        })
        .await?
    }

    async fn list(&self, limit: usize) -> Result<Vec<Conversation>> {
        let conn = self.conn.clone();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, title, messages, updated_at FROM chats
                 ORDER BY updated_at DESC LIMIT ?1",
            )?;
            let chats = stmt
                .query_map(params![limit], |row| Ok(Self::row_to_conversation(row)))?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            Ok(chats)
        })
        .await?
    }

    async fn update(&self, id: &str, patch: ConversationPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let conn = self.conn.clone();
        let id = id.to_string();
        let messages = patch
            .messages
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let title = patch.title;
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            let changed = conn.execute(
                "UPDATE chats SET
                    title = COALESCE(?2, title),
                    messages = COALESCE(?3, messages),
                    updated_at = CASE WHEN ?3 IS NULL THEN updated_at ELSE ?4 END
                 WHERE id = ?1",
                params![id, title, messages, Self::timestamp(&Utc::now())],
            )?;
            if changed == 0 {
                bail!("Chat not found: {}", id);
            }
            Ok(())
        })
        .await?
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.clone();
        let id = id.to_string();
        task::spawn_blocking(move || {
            let conn = Self::lock(&conn)?;
            conn.execute("DELETE FROM chats WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await?
    }
}
