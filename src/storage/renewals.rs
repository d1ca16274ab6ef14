use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{Connection, OpenFlags, Row, params};

use crate::core::types::{RenewalDefinition, RenewalHistoryEntry};

/// Persisted renewal definitions, keyed by id.
pub trait RenewalRepository: Send + Sync {
    fn list(&self) -> Result<Vec<RenewalDefinition>>;
    fn get(&self, id: &str) -> Result<Option<RenewalDefinition>>;
    /// Inserts or replaces the definition. History is kept separately.
    fn save(&self, definition: &RenewalDefinition) -> Result<()>;
    fn append_history(&self, id: &str, entry: &RenewalHistoryEntry) -> Result<()>;
    /// Returns whether a definition was removed.
    fn delete(&self, id: &str) -> Result<bool>;
}

/// SQLite-backed repository. Definitions are JSON blobs; history is one row per attempt.
#[derive(Clone)]
pub struct SqliteRenewalStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl SqliteRenewalStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .with_context(|| format!("failed to open SQLite database at {}", db_path.display()))?;
        Self::configure_connection(&conn)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(db_path.to_path_buf()),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory SQLite")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set SQLite busy timeout")?;
        Ok(())
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS renewals (
                id TEXT PRIMARY KEY,
                friendly_name TEXT NOT NULL,
                definition TEXT NOT NULL,
                next_due TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS renewal_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                renewal_id TEXT NOT NULL REFERENCES renewals(id) ON DELETE CASCADE,
                date TEXT NOT NULL,
                success INTEGER NOT NULL,
                message TEXT NOT NULL,
                thumbprint TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_renewal_history_renewal
                ON renewal_history(renewal_id);
            "#,
        )?;
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|err| anyhow!("SQLite connection poisoned: {err}"))
    }

    fn load_history(conn: &Connection, id: &str) -> Result<Vec<RenewalHistoryEntry>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT date, success, message, thumbprint
            FROM renewal_history
            WHERE renewal_id = ?1
            ORDER BY id ASC
            "#,
        )?;
        let mut rows = stmt.query(params![id])?;
        let mut history = Vec::new();
        while let Some(row) = rows.next()? {
            history.push(Self::row_to_history(row)?);
        }
        Ok(history)
    }

    fn row_to_history(row: &Row<'_>) -> Result<RenewalHistoryEntry> {
        let date_raw: String = row.get(0)?;
        let success: i64 = row.get(1)?;
        Ok(RenewalHistoryEntry {
            date: parse_timestamp(&date_raw)?,
            success: success != 0,
            message: row.get(2)?,
            thumbprint: row.get(3)?,
        })
    }

    fn decode(conn: &Connection, id: &str, raw: &str) -> Result<RenewalDefinition> {
        let mut definition: RenewalDefinition = serde_json::from_str(raw)
            .with_context(|| format!("failed to decode renewal {id}"))?;
        definition.history = Self::load_history(conn, id)?;
        Ok(definition)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse timestamp {raw}"))
}

impl RenewalRepository for SqliteRenewalStore {
    fn list(&self) -> Result<Vec<RenewalDefinition>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, definition
            FROM renewals
            ORDER BY friendly_name COLLATE NOCASE, id
            "#,
        )?;
        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        rows.iter()
            .map(|(id, raw)| Self::decode(&conn, id, raw))
            .collect()
    }

    fn get(&self, id: &str) -> Result<Option<RenewalDefinition>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT definition FROM renewals WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(Self::decode(&conn, id, &raw)?))
            }
            None => Ok(None),
        }
    }

    fn save(&self, definition: &RenewalDefinition) -> Result<()> {
        let blob = RenewalDefinition {
            history: Vec::new(),
            ..definition.clone()
        };
        let raw = serde_json::to_string(&blob)
            .with_context(|| format!("failed to encode renewal {}", definition.id))?;
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO renewals (id, friendly_name, definition, next_due, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                friendly_name = excluded.friendly_name,
                definition = excluded.definition,
                next_due = excluded.next_due,
                updated_at = excluded.updated_at
            "#,
            params![
                definition.id,
                definition.friendly_name,
                raw,
                definition.next_due.map(|due| due.to_rfc3339()),
                Utc::now().to_rfc3339()
            ],
        )?;
        debug!("[storage] saved renewal {}", definition.id);
        Ok(())
    }

    fn append_history(&self, id: &str, entry: &RenewalHistoryEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"
            INSERT INTO renewal_history (renewal_id, date, success, message, thumbprint)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                id,
                entry.date.to_rfc3339(),
                entry.success as i64,
                entry.message,
                entry.thumbprint
            ],
        )
        .with_context(|| format!("failed to record history for renewal {id}"))?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn.execute("DELETE FROM renewals WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}
