//! `trackguard-types` – shared data model for the rule-evaluation core.
//!
//! Everything that crosses a crate boundary lives here: the upstream
//! telemetry envelope ([`TelemetryEvent`] / [`Fix`]), the per-cycle
//! [`IncomingPacket`] binding, buffered samples, geofence records, device
//! command actions, bus envelopes and the [`TrackError`] type.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Upstream telemetry envelope
// ────────────────────────────────────────────────────────────────────────────

/// Position-validity indicator as emitted by the upstream decoders.
///
/// Binary protocols report a boolean, the satellite relay and the legacy
/// decoders report `"A"` (valid) / `"V"` (void) or `"true"` / `"false"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PositionStatus {
    Flag(bool),
    Code(String),
}

impl PositionStatus {
    /// `true` for `true`, `"A"` and `"true"`; everything else is a void fix.
    pub fn is_valid(&self) -> bool {
        match self {
            PositionStatus::Flag(flag) => *flag,
            PositionStatus::Code(code) => code == "A" || code == "true",
        }
    }

    /// The raw upstream encoding, as a string.
    pub fn as_code(&self) -> String {
        match self {
            PositionStatus::Flag(flag) => flag.to_string(),
            PositionStatus::Code(code) => code.clone(),
        }
    }
}

impl From<bool> for PositionStatus {
    fn from(flag: bool) -> Self {
        PositionStatus::Flag(flag)
    }
}

impl From<&str> for PositionStatus {
    fn from(code: &str) -> Self {
        PositionStatus::Code(code.to_string())
    }
}

/// Event classification attached to every fix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCode {
    #[serde(rename = "Code", default)]
    pub code: i64,
    #[serde(rename = "Name", default)]
    pub name: String,
}

/// One fix record inside the upstream envelope.
///
/// `speed` is in the upstream unit (m/s); the packet adapter converts it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    #[serde(rename = "EventCode", default)]
    pub event_code: EventCode,
    #[serde(rename = "Latitude", default)]
    pub latitude: f64,
    #[serde(rename = "Longitude", default)]
    pub longitude: f64,
    #[serde(rename = "Speed", default)]
    pub speed: f64,
    #[serde(rename = "Altitude", default)]
    pub altitude: f64,
    /// ISO-8601 UTC timestamp, kept raw so an unparseable value only
    /// invalidates this fix and not the whole envelope.
    #[serde(rename = "Datetime", default)]
    pub datetime: Option<String>,
    #[serde(rename = "GSMSignalStrength", default)]
    pub gsm_signal_strength: Option<i64>,
    #[serde(rename = "PositioningStatus", default)]
    pub positioning_status: Option<PositionStatus>,
}

impl Fix {
    /// Parsed timestamp, or `None` when the fix carries no usable time.
    ///
    /// Absent, empty and unparseable values count as unset, and so do the
    /// two zero instants upstream decoders emit for "no clock":
    /// `0001-01-01T00:00:00Z` and the Unix epoch.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let raw = self.datetime.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        let parsed = DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| {
                NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|n| n.and_utc())
            })
            .ok()?;
        if is_zero_instant(&parsed) { None } else { Some(parsed) }
    }
}

fn is_zero_instant(ts: &DateTime<Utc>) -> bool {
    ts.timestamp() == 0 || ts.timestamp() <= ZERO_TIME_SECS
}

/// Seconds from the Unix epoch to `0001-01-01T00:00:00Z`.
const ZERO_TIME_SECS: i64 = -62_135_596_800;

/// A normalised telemetry report: one device, one or more fixes.
///
/// Deserialises from the upstream envelope
/// `{"IMEI": "...", "ListPackets": {...}}`, where `ListPackets` is either an
/// object keyed by packet label or an array.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawTelemetryEvent")]
pub struct TelemetryEvent {
    pub imei: String,
    pub fixes: Vec<Fix>,
}

#[derive(Deserialize)]
struct RawTelemetryEvent {
    #[serde(rename = "IMEI", default)]
    imei: String,
    #[serde(rename = "ListPackets", default)]
    list_packets: Option<RawPackets>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPackets {
    Keyed(BTreeMap<String, Fix>),
    List(Vec<Fix>),
}

impl From<RawTelemetryEvent> for TelemetryEvent {
    fn from(raw: RawTelemetryEvent) -> Self {
        let fixes = match raw.list_packets {
            None => Vec::new(),
            Some(RawPackets::List(list)) => list,
            Some(RawPackets::Keyed(map)) => {
                let mut keyed: Vec<(String, Fix)> = map.into_iter().collect();
                keyed.sort_by_key(|(label, _)| packet_order_key(label));
                keyed.into_iter().map(|(_, fix)| fix).collect()
            }
        };
        Self { imei: raw.imei, fixes }
    }
}

// "packet_2" must sort before "packet_10".
fn packet_order_key(label: &str) -> (u64, String) {
    let digits: String = label
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let index = digits.parse::<u64>().unwrap_or(u64::MAX);
    (index, label.to_string())
}

// ────────────────────────────────────────────────────────────────────────────
// Evaluation binding
// ────────────────────────────────────────────────────────────────────────────

/// Evaluation flags set by the framework during the update phase and read by
/// rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct PacketFlags {
    pub buffer_updated: bool,
    pub buffer_has_10: bool,
    pub is_offline_for_5_min: bool,
    pub position_invalid_detected: bool,
    pub metrics_ready: bool,
    pub moving_with_weak_signal: bool,
    pub outside_all_safe_zones: bool,
}

/// One normalised device fix, bound as `IncomingPacket` for one evaluation
/// cycle and discarded afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct IncomingPacket {
    #[serde(rename = "IMEI")]
    pub imei: String,
    /// km/h.
    pub speed: i64,
    #[serde(rename = "GSMSignalStrength")]
    pub gsm_signal_strength: i64,
    pub datetime: DateTime<Utc>,
    /// Raw upstream validity encoding (`"A"`, `"V"`, `"true"`, ...).
    pub positioning_status: String,
    pub position_valid: bool,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(flatten)]
    pub flags: PacketFlags,
}

/// A buffered sample in a device's sliding window. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferEntry {
    pub imei: String,
    pub datetime: DateTime<Utc>,
    pub speed: i64,
    #[serde(rename = "gsm_signal")]
    pub gsm_signal_strength: i64,
    pub positioning_status: String,
    pub is_valid: bool,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&IncomingPacket> for BufferEntry {
    fn from(packet: &IncomingPacket) -> Self {
        Self {
            imei: packet.imei.clone(),
            datetime: packet.datetime,
            speed: packet.speed,
            gsm_signal_strength: packet.gsm_signal_strength,
            positioning_status: packet.positioning_status.clone(),
            is_valid: packet.position_valid,
            latitude: packet.latitude,
            longitude: packet.longitude,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Geofences
// ────────────────────────────────────────────────────────────────────────────

/// A geofence record as returned by the geofence store.
///
/// Optional fields mirror nullable store columns; which ones must be present
/// depends on `shape_type`. Bounding boxes use latitude for the Y axis and
/// longitude for the X axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: i64,
    pub name: String,
    pub shape_type: String,
    pub center_lat: Option<f64>,
    pub center_lon: Option<f64>,
    /// Meters.
    pub radius: Option<f64>,
    pub bbox_min_lat: Option<f64>,
    pub bbox_max_lat: Option<f64>,
    pub bbox_min_lon: Option<f64>,
    pub bbox_max_lon: Option<f64>,
}

/// A geofence resolved into a testable shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeofenceShape {
    Circle {
        center_lat: f64,
        center_lon: f64,
        radius_m: f64,
    },
    /// Polygon approximated by its axis-aligned bounding box.
    BoundingBox {
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    },
}

impl Geofence {
    /// Build a circle geofence.
    pub fn circle(name: &str, center_lat: f64, center_lon: f64, radius_m: f64) -> Self {
        Self {
            name: name.to_string(),
            shape_type: "circle".to_string(),
            center_lat: Some(center_lat),
            center_lon: Some(center_lon),
            radius: Some(radius_m),
            ..Self::default()
        }
    }

    /// Build a polygon geofence from its precomputed bounding box.
    pub fn polygon_bbox(name: &str, min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            name: name.to_string(),
            shape_type: "polygon".to_string(),
            bbox_min_lat: Some(min_lat),
            bbox_max_lat: Some(max_lat),
            bbox_min_lon: Some(min_lon),
            bbox_max_lon: Some(max_lon),
            ..Self::default()
        }
    }

    /// Resolve the record into a shape, or `None` when the shape type is
    /// unknown or a field the shape needs is missing.
    pub fn shape(&self) -> Option<GeofenceShape> {
        if self.shape_type.eq_ignore_ascii_case("circle") {
            return Some(GeofenceShape::Circle {
                center_lat: self.center_lat?,
                center_lon: self.center_lon?,
                radius_m: self.radius?,
            });
        }
        if self.shape_type.eq_ignore_ascii_case("polygon") {
            return Some(GeofenceShape::BoundingBox {
                min_lat: self.bbox_min_lat?,
                max_lat: self.bbox_max_lat?,
                min_lon: self.bbox_min_lon?,
                max_lon: self.bbox_max_lon?,
            });
        }
        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Device commands
// ────────────────────────────────────────────────────────────────────────────

/// Symbolic device-control action requested by a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum DeviceAction {
    CutEngine,
    RestoreEngine,
    /// Output number, valid range `1..=8`.
    ActivateOutput(u8),
    DeactivateOutput(u8),
    /// Vendor command suffix, already hex-encoded.
    Raw(String),
}

/// Outbound device command, routed by device id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub imei: String,
    /// Hex-encoded vendor command.
    pub payload: String,
    #[serde(rename = "remoteaddr", default, skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
}

/// Device id → transport address association for address-routed transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignMessage {
    pub imei: String,
    pub protocol: String,
    #[serde(rename = "remoteaddr")]
    pub remote_addr: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Bus envelope
// ────────────────────────────────────────────────────────────────────────────

/// Unified message wrapper for the pub/sub bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"trackguard-kernel::dispatch"`
    pub source: String,
    pub payload: BusPayload,
}

impl BusMessage {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: BusPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BusPayload {
    /// Raw normalised-event JSON from an upstream decoder.
    Telemetry(String),
    DeviceCommand(CommandMessage),
    DeviceAssign(AssignMessage),
    /// Human-readable alert text.
    Alert(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error type shared by every trackguard crate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackError {
    #[error("no packets in payload")]
    NoPackets,

    #[error("malformed telemetry event: {0}")]
    MalformedEvent(String),

    #[error("capability {0} already registered")]
    CapabilityExists(String),

    #[error("no capability bound as '{0}'")]
    UnknownBinding(String),

    #[error("binding '{binding}' has no operation '{operation}'")]
    UnknownOperation { binding: String, operation: String },

    #[error("invalid argument for {operation}: {details}")]
    InvalidArgument { operation: String, details: String },

    #[error("geofence store error: {0}")]
    Store(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("bus channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),
}
