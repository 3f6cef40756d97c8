//! Timing capability – last-valid-fix / current-fix bookkeeping per device.
//!
//! A device is *offline* when the gap between its current packet and its
//! last valid-position packet reaches a threshold. A device that never sent a
//! valid fix has no baseline and is never reported offline.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::debug;
use trackguard_types::{IncomingPacket, PositionStatus, TrackError};

use crate::capability::{AuditContributor, Capability, FunctionDescriptor, arg_i64, unknown_operation};

/// Per-device timing state. `None` is the zero value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimingState {
    pub last_valid_position: Option<DateTime<Utc>>,
    pub current_packet_time: Option<DateTime<Utc>>,
}

impl TimingState {
    /// Minutes between the current packet and the last valid one, when both
    /// are known.
    pub fn offline_minutes(&self) -> Option<f64> {
        let last_valid = self.last_valid_position?;
        let current = self.current_packet_time?;
        Some((current - last_valid).num_milliseconds() as f64 / 60_000.0)
    }
}

/// Offline detection, bound as `"timing"`.
#[derive(Default)]
pub struct TimingCapability {
    states: RwLock<HashMap<String, Arc<RwLock<TimingState>>>>,
}

const FUNCTIONS: &[FunctionDescriptor] = &[
    FunctionDescriptor {
        name: "isOfflineFor",
        args: &["minutes: int"],
        returns: "bool",
        description: "Current packet is at least `minutes` after the last valid fix",
    },
    FunctionDescriptor {
        name: "lastValidPosition",
        args: &[],
        returns: "datetime?",
        description: "Timestamp of the last valid-position fix",
    },
    FunctionDescriptor {
        name: "currentPacketTime",
        args: &[],
        returns: "datetime?",
        description: "Timestamp of the packet being evaluated",
    },
];

impl TimingCapability {
    pub fn new() -> Self {
        Self::default()
    }

    async fn state(&self, imei: &str) -> Arc<RwLock<TimingState>> {
        if let Some(state) = self.states.read().await.get(imei) {
            return Arc::clone(state);
        }
        let mut states = self.states.write().await;
        Arc::clone(states.entry(imei.to_string()).or_default())
    }

    /// Record a packet time; the last-valid time moves only for valid fixes.
    pub async fn update(&self, imei: &str, at: DateTime<Utc>, status: &PositionStatus) {
        let state = self.state(imei).await;
        let mut state = state.write().await;
        state.current_packet_time = Some(at);
        if status.is_valid() {
            state.last_valid_position = Some(at);
        }
    }

    pub async fn current(&self, imei: &str) -> TimingState {
        *self.state(imei).await.read().await
    }

    /// `true` iff a valid baseline exists and the current packet is at least
    /// `minutes` after it.
    pub async fn is_offline_for(&self, imei: &str, minutes: i64) -> bool {
        let state = self.current(imei).await;
        match state.offline_minutes() {
            Some(elapsed) if elapsed >= minutes as f64 => {
                debug!(imei = %imei, elapsed_min = elapsed, threshold_min = minutes, "device offline");
                true
            }
            _ => false,
        }
    }

    pub async fn device_count(&self) -> usize {
        self.states.read().await.len()
    }
}

#[async_trait]
impl Capability for TimingCapability {
    fn name(&self) -> &str {
        "timing"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn context_name(&self) -> &str {
        "timing"
    }

    async fn initialize(&self, imei: &str) {
        self.state(imei).await;
    }

    async fn snapshot(&self) -> Value {
        json!({ "devices": self.device_count().await })
    }

    async fn observe(&self, packet: &IncomingPacket) -> bool {
        let status = PositionStatus::Flag(packet.position_valid);
        self.update(&packet.imei, packet.datetime, &status).await;
        true
    }

    async fn invoke(&self, imei: &str, operation: &str, args: &[Value]) -> Result<Value, TrackError> {
        match operation {
            "isOfflineFor" => {
                let minutes = arg_i64(operation, args, 0)?;
                Ok(json!(self.is_offline_for(imei, minutes).await))
            }
            "lastValidPosition" => Ok(json!(self.current(imei).await.last_valid_position)),
            "currentPacketTime" => Ok(json!(self.current(imei).await.current_packet_time)),
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
impl AuditContributor for TimingCapability {
    async fn audit_snapshot(&self, imei: &str) -> Option<Value> {
        let state = *self.states.read().await.get(imei)?.read().await;
        Some(json!({
            "timing_state": {
                "last_valid_position": state.last_valid_position,
                "current_packet_time": state.current_packet_time,
                "offline_minutes": state.offline_minutes(),
            }
        }))
    }
}
