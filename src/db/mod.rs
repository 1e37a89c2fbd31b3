use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use thiserror::Error;

use self::models::{SyncState, Trigger};
use crate::triage::scheduler::TriggerService;
use crate::triage::watermark::KeyValueStore;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("json serialization: {0}")]
    Json(#[from] serde_json::Error),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

pub mod migrations;
pub mod models;
pub mod schema;

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let mut db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.initialize()?;
        Ok(db)
    }

    pub fn initialize(&mut self) -> Result<(), DbError> {
        migrations::migrate(&self.conn)
            .map_err(|e| DbError::Config(format!("migration failed: {e}")))
    }

    pub fn default_db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("failed to determine home directory".to_string()))?;
        Ok(home.join(".triage").join("triage.db"))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_sync_state(&self, key: &str) -> Result<Option<SyncState>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM sync_state WHERE key = ? LIMIT 1")?;
        let mut rows = stmt.query([key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(SyncState::from_row(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn set_sync_state(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            r#"
            INSERT INTO sync_state (key, value, updated_at)
            VALUES (?, ?, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_sync_state(&self, key: &str) -> Result<usize, DbError> {
        Ok(self
            .conn
            .execute("DELETE FROM sync_state WHERE key = ?", [key])?)
    }

    pub fn list_triggers(&self) -> Result<Vec<Trigger>, DbError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, handler_name, interval_minutes, created_at
            FROM triggers
            ORDER BY id ASC
            "#,
        )?;
        let triggers = stmt
            .query_map([], Trigger::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(triggers)
    }

    pub fn delete_trigger(&self, id: i64) -> Result<usize, DbError> {
        Ok(self.conn.execute("DELETE FROM triggers WHERE id = ?", [id])?)
    }

    pub fn insert_trigger(
        &self,
        handler_name: &str,
        interval_minutes: u32,
        created_at: DateTime<Utc>,
    ) -> Result<Trigger, DbError> {
        let created_raw = created_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        self.conn.execute(
            "INSERT INTO triggers (handler_name, interval_minutes, created_at) VALUES (?, ?, ?)",
            params![handler_name, interval_minutes, created_raw],
        )?;

        let id = self.conn.last_insert_rowid();
        let trigger = self.conn.query_row(
            "SELECT id, handler_name, interval_minutes, created_at FROM triggers WHERE id = ?",
            [id],
            Trigger::from_row,
        )?;
        Ok(trigger)
    }

    /// Claims the named lease for `holder` when it is free, expired, or
    /// already held by the same holder. Returns whether the lease is held.
    pub fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let now_ms = now.timestamp_millis();
        let expires_at_ms = (now + ttl).timestamp_millis();
        let changed = self.conn.execute(
            r#"
            INSERT INTO cycle_leases (name, holder, expires_at_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at_ms = excluded.expires_at_ms
            WHERE cycle_leases.expires_at_ms <= ?4 OR cycle_leases.holder = excluded.holder
            "#,
            params![name, holder, expires_at_ms, now_ms],
        )?;
        Ok(changed == 1)
    }

    pub fn release_lease(&self, name: &str, holder: &str) -> Result<(), DbError> {
        self.conn.execute(
            "DELETE FROM cycle_leases WHERE name = ? AND holder = ?",
            params![name, holder],
        )?;
        Ok(())
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.get_sync_state(key)?.and_then(|state| state.value))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.set_sync_state(key, value)?;
        Ok(())
    }
}

impl TriggerService for Database {
    fn list_triggers(&self) -> anyhow::Result<Vec<Trigger>> {
        Ok(Database::list_triggers(self)?)
    }

    fn delete_trigger(&self, trigger: &Trigger) -> anyhow::Result<()> {
        Database::delete_trigger(self, trigger.id)?;
        Ok(())
    }

    fn create_periodic_trigger(
        &self,
        handler_name: &str,
        interval_minutes: u32,
    ) -> anyhow::Result<Trigger> {
        Ok(self.insert_trigger(handler_name, interval_minutes, Utc::now())?)
    }
}
