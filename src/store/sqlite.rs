use rusqlite::{Connection, params, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::{Bot, BotStatus, BotUpdate, NewBot};
use crate::error::{Result, RunnerError};
use crate::store::BotStore;

/// SQLite-based bot store
///
/// Schema:
/// ```sql
/// CREATE TABLE bots (
///     id TEXT PRIMARY KEY,
///     name TEXT NOT NULL,
///     script_path TEXT NOT NULL,
///     manifest_path TEXT,
///     status TEXT NOT NULL DEFAULT 'stopped',
///     uploaded_at TEXT NOT NULL,
///     logs TEXT NOT NULL DEFAULT ''
/// );
/// ```
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

const SELECT_COLUMNS: &str =
    "SELECT id, name, script_path, manifest_path, status, uploaded_at, logs FROM bots";

impl SqliteStore {
    /// Open (or create) the store at `db_path`. `:memory:` gives a private in-memory database.
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                script_path TEXT NOT NULL,
                manifest_path TEXT,
                status TEXT NOT NULL DEFAULT 'stopped',
                uploaded_at TEXT NOT NULL,
                logs TEXT NOT NULL DEFAULT ''
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bots_uploaded_at ON bots(uploaded_at)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RunnerError::Store("connection lock poisoned".to_string()))
    }

    fn row_to_bot(row: &Row<'_>) -> rusqlite::Result<Bot> {
        let status_str: String = row.get(4)?;
        let status: BotStatus = status_str.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                4,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?;

        let uploaded_str: String = row.get(5)?;
        let uploaded_at = DateTime::parse_from_rfc3339(&uploaded_str)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    5,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;

        Ok(Bot {
            id: row.get(0)?,
            name: row.get(1)?,
            script_path: PathBuf::from(row.get::<_, String>(2)?),
            manifest_path: row.get::<_, Option<String>>(3)?.map(PathBuf::from),
            status,
            uploaded_at,
            logs: row.get(6)?,
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<Bot>> {
        let bot = conn
            .query_row(
                &format!("{} WHERE id = ?", SELECT_COLUMNS),
                params![id],
                Self::row_to_bot,
            )
            .optional()?;
        Ok(bot)
    }
}

#[async_trait]
impl BotStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<Bot>> {
        let conn = self.conn()?;
        Self::fetch(&conn, id)
    }

    async fn create(&self, new_bot: NewBot) -> Result<Bot> {
        let bot = Bot {
            id: Uuid::new_v4().to_string(),
            name: new_bot.name,
            script_path: new_bot.script_path,
            manifest_path: new_bot.manifest_path,
            status: new_bot.status,
            uploaded_at: Utc::now(),
            logs: new_bot.logs,
        };

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bots (id, name, script_path, manifest_path, status, uploaded_at, logs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                bot.id,
                bot.name,
                bot.script_path.to_string_lossy(),
                bot.manifest_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                bot.status.as_str(),
                bot.uploaded_at.to_rfc3339(),
                bot.logs,
            ],
        )?;

        Ok(bot)
    }

    async fn update(&self, id: &str, update: BotUpdate) -> Result<Bot> {
        let conn = self.conn()?;

        // COALESCE keeps the stored value for fields the update leaves out
        let changed = conn.execute(
            "UPDATE bots SET status = COALESCE(?2, status), logs = COALESCE(?3, logs) WHERE id = ?1",
            params![id, update.status.map(|s| s.as_str()), update.logs],
        )?;

        if changed == 0 {
            return Err(RunnerError::NotFound(id.to_string()));
        }

        Self::fetch(&conn, id)?.ok_or_else(|| RunnerError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM bots WHERE id = ?", params![id])?;
        Ok(deleted > 0)
    }

    async fn list(&self) -> Result<Vec<Bot>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY uploaded_at ASC, id ASC", SELECT_COLUMNS))?;
        let bots = stmt
            .query_map([], Self::row_to_bot)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_create() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let bot = store
            .create(NewBot::new("echo", "bots/echo.py").with_logs("ready"))
            .await
            .unwrap();

        assert_eq!(bot.status, BotStatus::Stopped);
        assert_eq!(bot.logs, "ready");
        assert!(!bot.id.is_empty());

        let fetched = store.get(&bot.id).await.unwrap().unwrap();
        assert_eq!(fetched, Bot { uploaded_at: fetched.uploaded_at, ..bot });
    }

    #[tokio::test]
    async fn test_store_get_missing() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_partial_update() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let bot = store
            .create(NewBot::new("echo", "bots/echo.py").with_logs("first"))
            .await
            .unwrap();

        let updated = store.update(&bot.id, BotUpdate::status(BotStatus::Running)).await.unwrap();
        assert_eq!(updated.status, BotStatus::Running);
        assert_eq!(updated.logs, "first");

        let updated = store.update(&bot.id, BotUpdate::logs("second")).await.unwrap();
        assert_eq!(updated.status, BotStatus::Running);
        assert_eq!(updated.logs, "second");
    }

    #[tokio::test]
    async fn test_store_update_missing() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let result = store.update("nope", BotUpdate::status(BotStatus::Running)).await;
        assert!(matches!(result, Err(RunnerError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_store_delete() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let bot = store.create(NewBot::new("echo", "bots/echo.py")).await.unwrap();

        assert!(store.delete(&bot.id).await.unwrap());
        assert!(!store.delete(&bot.id).await.unwrap());
        assert!(store.get(&bot.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_list_in_upload_order() {
        let store = SqliteStore::new(":memory:").await.unwrap();
        let first = store.create(NewBot::new("first", "a.py")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store
            .create(NewBot::new("second", "b.py").with_manifest("requirements.txt"))
            .await
            .unwrap();

        let bots = store.list().await.unwrap();
        assert_eq!(bots.len(), 2);
        assert_eq!(bots[0].id, first.id);
        assert_eq!(bots[1].id, second.id);
        assert_eq!(bots[1].manifest_path, Some(PathBuf::from("requirements.txt")));
    }
}
