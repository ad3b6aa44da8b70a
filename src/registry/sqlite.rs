//! SQLite registry
//! Per-key transactional storage for domain records

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{DomainRecord, Registry, RegistryError};

const SELECT_COLUMNS: &str = "name, subfolder, ssl_enabled, active, created_at, updated_at";

/// Thread-safe registry over a single SQLite connection
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
    db_path: String,
}

impl SqliteRegistry {
    /// Open (or create) the database at `db_path`
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, RegistryError> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        // Other domainctl processes may hold the write lock briefly
        conn.busy_timeout(Duration::from_secs(5))?;

        let registry = Self {
            conn: Mutex::new(conn),
            db_path: db_path_str,
        };
        registry.initialize()?;

        Ok(registry)
    }

    fn initialize(&self) -> Result<(), RegistryError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS domains (
                name TEXT PRIMARY KEY,
                subfolder TEXT NOT NULL,
                ssl_enabled INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<DomainRecord> {
        Ok(DomainRecord {
            name: row.get(0)?,
            subfolder: row.get(1)?,
            ssl_enabled: row.get(2)?,
            active: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

impl Registry for SqliteRegistry {
    fn list_all(&self) -> Result<Vec<DomainRecord>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM domains ORDER BY rowid",
            SELECT_COLUMNS
        ))?;

        let records = stmt
            .query_map([], Self::map_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    fn get(&self, name: &str) -> Result<Option<DomainRecord>, RegistryError> {
        let conn = self.conn.lock();

        let record = conn
            .query_row(
                &format!("SELECT {} FROM domains WHERE name = ?1", SELECT_COLUMNS),
                params![name],
                Self::map_row,
            )
            .optional()?;

        Ok(record)
    }

    fn upsert(&self, record: DomainRecord) -> Result<DomainRecord, RegistryError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        // created_at is only written on first insert
        tx.execute(
            "INSERT INTO domains (name, subfolder, ssl_enabled, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                subfolder = excluded.subfolder,
                ssl_enabled = excluded.ssl_enabled,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                record.name,
                record.subfolder,
                record.ssl_enabled,
                record.active,
                record.created_at,
                Utc::now(),
            ],
        )?;

        let stored = tx.query_row(
            &format!("SELECT {} FROM domains WHERE name = ?1", SELECT_COLUMNS),
            params![record.name],
            Self::map_row,
        )?;
        tx.commit()?;

        debug!("Upserted {} in {}", stored.name, self.db_path);
        Ok(stored)
    }

    fn remove(&self, name: &str) -> Result<bool, RegistryError> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM domains WHERE name = ?1", params![name])?;
        Ok(affected > 0)
    }
}
