//! SQLite-backed [`AlertAuditSink`].
//!
//! # Storage layout
//!
//! | table | columns |
//! |---|---|
//! | `alert_audit` | `id`, `imei`, `alert_id`, `claimed_at` (RFC 3339), `snapshot` (JSON) |
//!
//! One row per won alert claim. Rows are append-only.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, warn};
use trackguard_kernel::{AlertAuditRecord, AlertAuditSink};
use trackguard_types::TrackError;

use crate::geofence_store::StoreError;

/// Alert claim trail persisted in SQLite.
#[derive(Clone)]
pub struct SqliteAlertAuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAlertAuditStore {
    /// Open (or create) the database at `path`. The file may be shared with
    /// the geofence store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS alert_audit (
                 id         INTEGER PRIMARY KEY AUTOINCREMENT,
                 imei       TEXT NOT NULL,
                 alert_id   TEXT NOT NULL,
                 claimed_at TEXT NOT NULL,
                 snapshot   TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_alert_audit_imei ON alert_audit (imei, claimed_at);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }

    /// Append `record` and return its row id.
    pub fn insert(&self, record: &AlertAuditRecord) -> Result<i64, StoreError> {
        let snapshot = serde_json::to_string(&record.snapshot)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO alert_audit (imei, alert_id, claimed_at, snapshot)
                 VALUES (?1, ?2, ?3, ?4)",
                params![record.imei, record.alert_id, record.claimed_at.to_rfc3339(), snapshot],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Every record for `imei`, oldest first. Unreadable rows are skipped.
    pub fn records_for(&self, imei: &str) -> Result<Vec<AlertAuditRecord>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, imei, alert_id, claimed_at, snapshot
                 FROM alert_audit
                 WHERE imei = ?1
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![imei], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (id, imei, alert_id, claimed_at, snapshot) = row?;
                let claimed_at = match DateTime::parse_from_rfc3339(&claimed_at) {
                    Ok(t) => t.with_timezone(&Utc),
                    Err(e) => {
                        warn!(id, error = %e, "skipping alert audit row with bad timestamp");
                        continue;
                    }
                };
                let snapshot = match serde_json::from_str(&snapshot) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(id, error = %e, "skipping alert audit row with bad snapshot");
                        continue;
                    }
                };
                records.push(AlertAuditRecord {
                    imei,
                    alert_id,
                    claimed_at,
                    snapshot,
                });
            }
            Ok(records)
        })
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM alert_audit", [], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
    }
}

#[async_trait]
impl AlertAuditSink for SqliteAlertAuditStore {
    async fn record(&self, record: &AlertAuditRecord) -> Result<(), TrackError> {
        let store = self.clone();
        let record = record.clone();
        let id = tokio::task::spawn_blocking(move || store.insert(&record))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))??;
        debug!(row = id, "alert audit row written");
        Ok(())
    }
}
