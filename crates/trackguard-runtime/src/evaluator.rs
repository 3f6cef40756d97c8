//! [`Evaluator`] – one evaluation cycle per packet.
//!
//! ```text
//! payload ──adapter──▶ packets ──for each──▶ build context
//!                                            │
//!                      update phase ◀────────┘  (capabilities observe)
//!                           │
//!                      set flags ──▶ rule engine ──▶ audit snapshot
//! ```
//!
//! The context holds capability handles, not copies, so rules observe
//! post-update state. `BufferUpdated` comes from the update phase itself:
//! it is set when the buffer accepted this packet.
//!
//! Cycles for the same device may overlap; each capability update is atomic
//! on its own and nothing spans capabilities.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{Instrument, debug, info_span, warn};
use trackguard_kernel::{BindingContext, CapabilityRegistry};
use trackguard_middleware::PacketAdapter;
use trackguard_types::{IncomingPacket, PacketFlags, TrackError};

use crate::jammer::JammerThresholds;
use crate::rules::RuleEngine;

/// Registry name of the sliding-window capability.
const BUFFER: &str = "buffer";

/// Evaluator settings.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Groups whose geofences count as safe zones.
    pub safe_zones: Vec<String>,
    pub thresholds: JammerThresholds,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            safe_zones: trackguard_kernel::geofence::DEFAULT_SAFE_ZONES
                .iter()
                .map(|g| g.to_string())
                .collect(),
            thresholds: JammerThresholds::default(),
        }
    }
}

/// Outcome of one packet's cycle.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub imei: String,
    pub datetime: DateTime<Utc>,
    pub flags: PacketFlags,
    /// Rules that fired, in order.
    pub fired: Vec<String>,
    /// Set when the cycle stopped early.
    pub error: Option<String>,
}

impl EvaluationReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Evaluator {
    adapter: Arc<dyn PacketAdapter>,
    registry: Arc<CapabilityRegistry>,
    engine: Arc<dyn RuleEngine>,
    config: EvaluatorConfig,
}

impl Evaluator {
    pub fn new(
        adapter: Arc<dyn PacketAdapter>,
        registry: Arc<CapabilityRegistry>,
        engine: Arc<dyn RuleEngine>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            adapter,
            registry,
            engine,
            config,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Evaluate every packet in `payload`.
    ///
    /// Malformed or empty payloads fail as a whole (logged). A failure inside
    /// one packet's cycle is logged and recorded on its report; later packets
    /// still run.
    pub async fn process(&self, payload: &str) -> Result<Vec<EvaluationReport>, TrackError> {
        let packets = match self.adapter.parse(payload) {
            Ok(packets) => packets,
            Err(e) => {
                warn!(error = %e, "telemetry event rejected");
                return Err(e);
            }
        };

        let mut reports = Vec::with_capacity(packets.len());
        for packet in packets {
            let span = info_span!("evaluate", imei = %packet.imei, datetime = %packet.datetime);
            reports.push(self.evaluate(packet).instrument(span).await);
        }
        Ok(reports)
    }

    /// Run one cycle for an already-adapted packet.
    pub async fn evaluate(&self, mut packet: IncomingPacket) -> EvaluationReport {
        let ctx = self.registry.build_context(&packet.imei).await;
        let outcome = self.run_cycle(&ctx, &mut packet).await;

        let (fired, error) = match outcome {
            Ok(fired) => (fired, None),
            Err(e) => {
                warn!(error = %e, "evaluation cycle failed");
                (Vec::new(), Some(e.to_string()))
            }
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            let snapshot = self.audit(&packet).await;
            debug!(snapshot = %snapshot, fired = ?fired, "evaluation cycle complete");
        }

        EvaluationReport {
            imei: packet.imei,
            datetime: packet.datetime,
            flags: packet.flags,
            fired,
            error,
        }
    }

    async fn run_cycle(&self, ctx: &BindingContext, packet: &mut IncomingPacket) -> Result<Vec<String>, TrackError> {
        let accepted = self.registry.update(packet).await;
        let buffer_updated = accepted.iter().any(|name| name == BUFFER);
        packet.flags = self.compute_flags(ctx, packet, buffer_updated).await?;
        self.engine.execute(ctx, packet).await
    }

    async fn compute_flags(
        &self,
        ctx: &BindingContext,
        packet: &IncomingPacket,
        buffer_updated: bool,
    ) -> Result<PacketFlags, TrackError> {
        let t = &self.config.thresholds;
        let buffer_has_10 = ctx
            .call_bool("buffer", "hasAtLeast", &[json!(t.min_buffer_entries)])
            .await?;
        let metrics_ready = ctx
            .call_bool(
                "buffer",
                "hasAtLeast",
                &[json!(trackguard_kernel::metrics::SIGNAL_SAMPLES)],
            )
            .await?;
        let is_offline = ctx
            .call_bool("timing", "isOfflineFor", &[json!(t.offline_minutes)])
            .await?;

        let moving_with_weak_signal = if buffer_has_10 {
            let speed = ctx.call_i64("metrics", "averageSpeed90Min", &[]).await?;
            let signal = ctx.call_i64("metrics", "averageSignalLast5", &[]).await?;
            speed >= t.min_avg_speed && signal < t.max_avg_signal
        } else {
            false
        };

        let inside_safe_zone = ctx
            .call_bool(
                "geo",
                "isInsideAnyGroup",
                &[
                    json!(self.config.safe_zones),
                    json!(packet.latitude),
                    json!(packet.longitude),
                ],
            )
            .await?;

        Ok(PacketFlags {
            buffer_updated,
            buffer_has_10,
            is_offline_for_5_min: is_offline,
            position_invalid_detected: !packet.position_valid,
            metrics_ready,
            moving_with_weak_signal,
            outside_all_safe_zones: !inside_safe_zone,
        })
    }

    /// Registry audit snapshot plus the packet as evaluated.
    pub async fn audit(&self, packet: &IncomingPacket) -> Value {
        let mut snapshot = self.registry.snapshot(&packet.imei).await;
        if let Value::Object(map) = &mut snapshot {
            map.insert("packet_current".into(), json!(packet));
        }
        snapshot
    }
}
