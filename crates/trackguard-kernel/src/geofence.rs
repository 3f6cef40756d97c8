//! Geofence capability – last-known coordinates and group containment.
//!
//! Geofences live in an external store behind [`GeofenceStore`]. Circles are
//! tested with the haversine great-circle distance; polygons only by their
//! precomputed bounding box, so a point inside the box but outside the true
//! outline counts as inside.
//!
//! A store error or timeout makes [`GeofenceCapability::is_inside_group`]
//! return `false`. Rules alerting on "outside all zones" therefore fire when
//! the store is unavailable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::{error, warn};
use trackguard_types::{Geofence, GeofenceShape, IncomingPacket, TrackError};

use crate::capability::{
    AuditContributor, Capability, FunctionDescriptor, arg_f64, arg_str, arg_str_list, unknown_operation,
};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Groups treated as safe zones unless configured otherwise.
pub const DEFAULT_SAFE_ZONES: [&str; 3] = ["Taller", "CLIENTES", "Resguardo/Cedis/Puerto"];

// ────────────────────────────────────────────────────────────────────────────
// Store boundary
// ────────────────────────────────────────────────────────────────────────────

/// Read-only access to geofence groups.
#[async_trait]
pub trait GeofenceStore: Send + Sync {
    /// Every geofence tagged with `group`. Unknown groups yield an empty list.
    async fn geofences_by_group(&self, group: &str) -> Result<Vec<Geofence>, TrackError>;
}

/// Store kept in memory; used when no database is configured and in tests.
#[derive(Default)]
pub struct InMemoryGeofenceStore {
    groups: RwLock<HashMap<String, Vec<Geofence>>>,
}

impl InMemoryGeofenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, group: &str, geofence: Geofence) {
        self.groups
            .write()
            .await
            .entry(group.to_string())
            .or_default()
            .push(geofence);
    }
}

#[async_trait]
impl GeofenceStore for InMemoryGeofenceStore {
    async fn geofences_by_group(&self, group: &str) -> Result<Vec<Geofence>, TrackError> {
        Ok(self.groups.read().await.get(group).cloned().unwrap_or_default())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Geometry
// ────────────────────────────────────────────────────────────────────────────

/// Great-circle distance in meters between two points in decimal degrees.
pub fn haversine_distance_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Whether `(lat, lon)` lies inside `shape` (edges inclusive).
pub fn shape_contains(shape: &GeofenceShape, lat: f64, lon: f64) -> bool {
    match *shape {
        GeofenceShape::Circle {
            center_lat,
            center_lon,
            radius_m,
        } => haversine_distance_m(lat, lon, center_lat, center_lon) <= radius_m,
        GeofenceShape::BoundingBox {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        } => lat >= min_lat && lat <= max_lat && lon >= min_lon && lon <= max_lon,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Capability
// ────────────────────────────────────────────────────────────────────────────

/// Containment queries, bound as `"geo"`.
pub struct GeofenceCapability {
    store: Arc<dyn GeofenceStore>,
    store_timeout: Duration,
    audit_groups: Vec<String>,
    last_positions: RwLock<HashMap<String, (f64, f64)>>,
}

const FUNCTIONS: &[FunctionDescriptor] = &[
    FunctionDescriptor {
        name: "isInsideGroup",
        args: &["group: string", "lat: float", "lon: float"],
        returns: "bool",
        description: "Point lies inside any geofence of the group",
    },
    FunctionDescriptor {
        name: "isInsideAnyGroup",
        args: &["groups: string[]", "lat: float", "lon: float"],
        returns: "bool",
        description: "Point lies inside any geofence of any listed group",
    },
    FunctionDescriptor {
        name: "lastPosition",
        args: &[],
        returns: "{lat, lon}?",
        description: "Last cached coordinates of the device",
    },
];

impl GeofenceCapability {
    pub fn new(store: Arc<dyn GeofenceStore>) -> Self {
        Self {
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            audit_groups: DEFAULT_SAFE_ZONES.iter().map(|g| g.to_string()).collect(),
            last_positions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Groups reported in the audit snapshot.
    pub fn with_audit_groups(mut self, groups: Vec<String>) -> Self {
        self.audit_groups = groups;
        self
    }

    pub async fn update_last_position(&self, imei: &str, lat: f64, lon: f64) {
        self.last_positions
            .write()
            .await
            .insert(imei.to_string(), (lat, lon));
    }

    pub async fn last_position(&self, imei: &str) -> Option<(f64, f64)> {
        self.last_positions.read().await.get(imei).copied()
    }

    /// `true` when the point lies inside any usable geofence of `group`.
    /// Store errors and timeouts are logged and yield `false`.
    pub async fn is_inside_group(&self, group: &str, lat: f64, lon: f64) -> bool {
        let geofences =
            match tokio::time::timeout(self.store_timeout, self.store.geofences_by_group(group)).await {
                Ok(Ok(geofences)) => geofences,
                Ok(Err(e)) => {
                    error!(group = %group, error = %e, "geofence store query failed");
                    return false;
                }
                Err(_) => {
                    error!(group = %group, timeout_ms = self.store_timeout.as_millis() as u64, "geofence store query timed out");
                    return false;
                }
            };

        geofences.iter().any(|geofence| match geofence.shape() {
            Some(shape) => shape_contains(&shape, lat, lon),
            None => {
                warn!(
                    group = %group,
                    geofence = %geofence.name,
                    shape_type = %geofence.shape_type,
                    "skipping geofence with unknown shape or missing fields"
                );
                false
            }
        })
    }

    pub async fn is_inside_any_group(&self, groups: &[String], lat: f64, lon: f64) -> bool {
        for group in groups {
            if self.is_inside_group(group, lat, lon).await {
                return true;
            }
        }
        false
    }

    pub async fn device_count(&self) -> usize {
        self.last_positions.read().await.len()
    }
}

#[async_trait]
impl Capability for GeofenceCapability {
    fn name(&self) -> &str {
        "geofence"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn context_name(&self) -> &str {
        "geo"
    }

    async fn initialize(&self, _imei: &str) {}

    async fn snapshot(&self) -> Value {
        json!({
            "devices": self.device_count().await,
            "audit_groups": self.audit_groups,
            "store_timeout_ms": self.store_timeout.as_millis() as u64,
        })
    }

    async fn observe(&self, packet: &IncomingPacket) -> bool {
        self.update_last_position(&packet.imei, packet.latitude, packet.longitude)
            .await;
        true
    }

    async fn invoke(&self, imei: &str, operation: &str, args: &[Value]) -> Result<Value, TrackError> {
        match operation {
            "isInsideGroup" => {
                let group = arg_str(operation, args, 0)?;
                let lat = arg_f64(operation, args, 1)?;
                let lon = arg_f64(operation, args, 2)?;
                Ok(json!(self.is_inside_group(group, lat, lon).await))
            }
            "isInsideAnyGroup" => {
                let groups = arg_str_list(operation, args, 0)?;
                let lat = arg_f64(operation, args, 1)?;
                let lon = arg_f64(operation, args, 2)?;
                Ok(json!(self.is_inside_any_group(&groups, lat, lon).await))
            }
            "lastPosition" => Ok(match self.last_position(imei).await {
                Some((lat, lon)) => json!({ "lat": lat, "lon": lon }),
                None => Value::Null,
            }),
            other => Err(unknown_operation(self.context_name(), other)),
        }
    }

    fn functions(&self) -> &'static [FunctionDescriptor] {
        FUNCTIONS
    }

    fn as_audit(&self) -> Option<&dyn AuditContributor> {
        Some(self)
    }
}

#[async_trait]
impl AuditContributor for GeofenceCapability {
    async fn audit_snapshot(&self, imei: &str) -> Option<Value> {
        let (lat, lon) = self.last_position(imei).await?;
        let mut checks = Map::new();
        for group in &self.audit_groups {
            checks.insert(group.clone(), json!(self.is_inside_group(group, lat, lon).await));
        }
        Some(json!({ "geofence_checks": checks }))
    }
}
