//! SQLite-backed [`GeofenceStore`].
//!
//! # Storage layout
//!
//! | table | columns |
//! |---|---|
//! | `geofences` | `id`, `name`, `shape_type`, `center_lat`, `center_lon`, `radius`, `bbox_min_lat`, `bbox_max_lat`, `bbox_min_lon`, `bbox_max_lon` |
//! | `geofence_groups` | `id`, `name` (unique) |
//! | `geofence_group_mapping` | `geofence_id`, `group_id` |
//!
//! Shape columns are nullable; rows whose shape cannot be resolved are still
//! returned and skipped by the containment check.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;
use tracing::{debug, warn};
use trackguard_kernel::GeofenceStore;
use trackguard_types::{Geofence, TrackError};

/// Errors raised by the SQLite store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection lock poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Join(String),
    #[error("unknown geofence group '{0}'")]
    UnknownGroup(String),
}

impl From<StoreError> for TrackError {
    fn from(e: StoreError) -> Self {
        TrackError::Store(e.to_string())
    }
}

/// Geofence groups persisted in SQLite.
#[derive(Clone)]
pub struct SqliteGeofenceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGeofenceStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS geofences (
                 id           INTEGER PRIMARY KEY AUTOINCREMENT,
                 name         TEXT NOT NULL,
                 shape_type   TEXT NOT NULL,
                 center_lat   REAL,
                 center_lon   REAL,
                 radius       REAL,
                 bbox_min_lat REAL,
                 bbox_max_lat REAL,
                 bbox_min_lon REAL,
                 bbox_max_lon REAL
             );
             CREATE TABLE IF NOT EXISTS geofence_groups (
                 id   INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL UNIQUE
             );
             CREATE TABLE IF NOT EXISTS geofence_group_mapping (
                 geofence_id INTEGER NOT NULL REFERENCES geofences(id) ON DELETE CASCADE,
                 group_id    INTEGER NOT NULL REFERENCES geofence_groups(id) ON DELETE CASCADE,
                 PRIMARY KEY (geofence_id, group_id)
             );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }

    /// Create `name` if missing and return its id.
    pub fn ensure_group(&self, name: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute("INSERT OR IGNORE INTO geofence_groups (name) VALUES (?1)", params![name])?;
            Ok(conn.query_row(
                "SELECT id FROM geofence_groups WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?)
        })
    }

    /// Insert `geofence` (its `id` is ignored) and return the new id.
    pub fn insert_geofence(&self, geofence: &Geofence) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO geofences
                     (name, shape_type, center_lat, center_lon, radius,
                      bbox_min_lat, bbox_max_lat, bbox_min_lon, bbox_max_lon)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    geofence.name,
                    geofence.shape_type,
                    geofence.center_lat,
                    geofence.center_lon,
                    geofence.radius,
                    geofence.bbox_min_lat,
                    geofence.bbox_max_lat,
                    geofence.bbox_min_lon,
                    geofence.bbox_max_lon,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Tag an existing geofence with an existing group.
    pub fn assign(&self, geofence_id: i64, group: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let group_id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM geofence_groups WHERE name = ?1",
                    params![group],
                    |row| row.get(0),
                )
                .optional()?;
            let group_id = group_id.ok_or_else(|| StoreError::UnknownGroup(group.to_string()))?;
            conn.execute(
                "INSERT OR IGNORE INTO geofence_group_mapping (geofence_id, group_id) VALUES (?1, ?2)",
                params![geofence_id, group_id],
            )?;
            Ok(())
        })
    }

    /// Insert `geofence` and tag it with `group`, creating the group.
    pub fn add_to_group(&self, group: &str, geofence: &Geofence) -> Result<i64, StoreError> {
        self.ensure_group(group)?;
        let id = self.insert_geofence(geofence)?;
        self.assign(id, group)?;
        debug!(group = %group, geofence = %geofence.name, id, "geofence stored");
        Ok(id)
    }

    pub fn group_names(&self) -> Result<Vec<String>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM geofence_groups ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    /// Blocking group query.
    pub fn geofences_in_group(&self, group: &str) -> Result<Vec<Geofence>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.shape_type, g.center_lat, g.center_lon, g.radius,
                        g.bbox_min_lat, g.bbox_max_lat, g.bbox_min_lon, g.bbox_max_lon
                 FROM geofences g
                 JOIN geofence_group_mapping m ON g.id = m.geofence_id
                 JOIN geofence_groups gg ON m.group_id = gg.id
                 WHERE gg.name = ?1
                 ORDER BY g.id",
            )?;
            let rows = stmt.query_map(params![group], geofence_from_row)?;
            let mut geofences = Vec::new();
            for row in rows {
                match row {
                    Ok(geofence) => geofences.push(geofence),
                    Err(e) => warn!(group = %group, error = %e, "skipping unreadable geofence row"),
                }
            }
            Ok(geofences)
        })
    }
}

fn geofence_from_row(row: &Row<'_>) -> rusqlite::Result<Geofence> {
    Ok(Geofence {
        id: row.get(0)?,
        name: row.get(1)?,
        shape_type: row.get(2)?,
        center_lat: row.get(3)?,
        center_lon: row.get(4)?,
        radius: row.get(5)?,
        bbox_min_lat: row.get(6)?,
        bbox_max_lat: row.get(7)?,
        bbox_min_lon: row.get(8)?,
        bbox_max_lon: row.get(9)?,
    })
}

#[async_trait]
impl GeofenceStore for SqliteGeofenceStore {
    async fn geofences_by_group(&self, group: &str) -> Result<Vec<Geofence>, TrackError> {
        let store = self.clone();
        let group = group.to_string();
        tokio::task::spawn_blocking(move || store.geofences_in_group(&group))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
            .map_err(TrackError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_query_joins_mapping() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteGeofenceStore::open_in_memory()?;
        store.add_to_group("CLIENTES", &Geofence::circle("acme", 19.4, -99.1, 100.0))?;
        store.add_to_group("Taller", &Geofence::polygon_bbox("shop", 19.0, 19.1, -99.2, -99.1))?;
        let shared = store.insert_geofence(&Geofence::circle("hub", 20.0, -100.0, 500.0))?;
        store.assign(shared, "CLIENTES")?;
        store.assign(shared, "Taller")?;

        let clientes = store.geofences_in_group("CLIENTES")?;
        let names: Vec<&str> = clientes.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["acme", "hub"]);
        assert_eq!(clientes[0].radius, Some(100.0));
        assert_eq!(clientes[0].bbox_min_lat, None);

        let taller = store.geofences_in_group("Taller")?;
        assert_eq!(taller.len(), 2);
        assert_eq!(taller[0].bbox_max_lon, Some(-99.1));

        assert!(store.geofences_in_group("nobody")?.is_empty());
        assert_eq!(store.group_names()?, vec!["CLIENTES".to_string(), "Taller".to_string()]);
        Ok(())
    }

    #[test]
    fn assign_to_missing_group_fails() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteGeofenceStore::open_in_memory()?;
        let id = store.insert_geofence(&Geofence::circle("x", 0.0, 0.0, 1.0))?;
        assert!(matches!(store.assign(id, "ghost"), Err(StoreError::UnknownGroup(_))));
        Ok(())
    }

    #[test]
    fn ensure_group_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteGeofenceStore::open_in_memory()?;
        let first = store.ensure_group("CLIENTES")?;
        let second = store.ensure_group("CLIENTES")?;
        assert_eq!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn persists_across_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("geofences.db");
        {
            let store = SqliteGeofenceStore::open(&path)?;
            store.add_to_group("Resguardo/Cedis/Puerto", &Geofence::circle("port", 19.0, -96.1, 800.0))?;
        }
        let store = SqliteGeofenceStore::open(&path)?;
        let geofences = store.geofences_by_group("Resguardo/Cedis/Puerto").await?;
        assert_eq!(geofences.len(), 1);
        assert_eq!(geofences[0].shape_type, "circle");
        Ok(())
    }

    #[test]
    fn store_error_maps_to_track_error() {
        let err: TrackError = StoreError::UnknownGroup("x".into()).into();
        assert!(matches!(err, TrackError::Store(_)));
    }
}
