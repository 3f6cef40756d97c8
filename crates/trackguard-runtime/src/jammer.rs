//! Built-in jammer-detection rules.
//!
//! A GPS jammer shows up as a device that was moving with a degrading cell
//! signal, then stops reporting valid positions while away from every safe
//! zone. The rules read the flags set by the evaluator's update phase and
//! act through the `"actions"` binding.
//!
//! | Rule | Salience | Condition |
//! |---|---|---|
//! | [`PositionInvalidRule`] | 100 | `PositionInvalidDetected` |
//! | [`WeakSignalRule`] | 90 | `MovingWithWeakSignal` |
//! | [`JammerAlertRule`] | 80 | offline, outside all safe zones and moving with weak signal |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use trackguard_kernel::BindingContext;
use trackguard_types::{IncomingPacket, TrackError};

use crate::rules::{Rule, SequentialRuleEngine};

/// Alert id claimed by [`JammerAlertRule`].
pub const JAMMER_ALERT_ID: &str = "jammer";

/// Thresholds used by the update phase and the jammer rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JammerThresholds {
    /// Buffered entries required before the movement statistics count.
    pub min_buffer_entries: usize,
    /// km/h.
    pub min_avg_speed: i64,
    /// Average signal strictly below this is weak.
    pub max_avg_signal: i64,
    pub offline_minutes: i64,
}

impl Default for JammerThresholds {
    fn default() -> Self {
        Self {
            min_buffer_entries: 10,
            min_avg_speed: 10,
            max_avg_signal: 15,
            offline_minutes: 5,
        }
    }
}

/// Audit-logs fixes with a void position.
pub struct PositionInvalidRule;

#[async_trait]
impl Rule for PositionInvalidRule {
    fn name(&self) -> &str {
        "position_invalid"
    }

    fn salience(&self) -> i32 {
        100
    }

    async fn evaluate(&self, ctx: &BindingContext, packet: &mut IncomingPacket) -> Result<bool, TrackError> {
        if !packet.flags.position_invalid_detected {
            return Ok(false);
        }
        let message = format!(
            "Posición inválida {} (estado {})",
            packet.imei, packet.positioning_status
        );
        ctx.call("actions", "log", &[json!(message)]).await?;
        Ok(true)
    }
}

/// Audit-logs devices moving with a weak signal.
pub struct WeakSignalRule;

#[async_trait]
impl Rule for WeakSignalRule {
    fn name(&self) -> &str {
        "moving_with_weak_signal"
    }

    fn salience(&self) -> i32 {
        90
    }

    async fn evaluate(&self, ctx: &BindingContext, packet: &mut IncomingPacket) -> Result<bool, TrackError> {
        if !packet.flags.moving_with_weak_signal {
            return Ok(false);
        }
        let speed = ctx.call_i64("metrics", "averageSpeed90Min", &[]).await?;
        let signal = ctx.call_i64("metrics", "averageSignalLast5", &[]).await?;
        let message = format!("Señal débil en movimiento {}: {speed} km/h, GSM {signal}", packet.imei);
        ctx.call("actions", "log", &[json!(message)]).await?;
        Ok(true)
    }
}

/// Claims the one-shot jammer alert; the winning cycle notifies and may cut
/// the engine.
pub struct JammerAlertRule {
    pub cut_engine: bool,
}

#[async_trait]
impl Rule for JammerAlertRule {
    fn name(&self) -> &str {
        "jammer_alert"
    }

    fn salience(&self) -> i32 {
        80
    }

    async fn evaluate(&self, ctx: &BindingContext, packet: &mut IncomingPacket) -> Result<bool, TrackError> {
        let flags = packet.flags;
        if !(flags.is_offline_for_5_min && flags.outside_all_safe_zones && flags.moving_with_weak_signal) {
            return Ok(false);
        }
        if !ctx.call_bool("actions", "markSent", &[json!(JAMMER_ALERT_ID)]).await? {
            return Ok(false);
        }

        let message = format!(
            "Posible inhibidor (jammer) en {}: sin posición válida y fuera de zonas seguras. Última posición {:.6}, {:.6}",
            packet.imei, packet.latitude, packet.longitude
        );
        info!(imei = %packet.imei, "jammer alert raised");
        ctx.call("actions", "notify", &[json!(message)]).await?;
        ctx.call("actions", "log", &[json!(message)]).await?;
        if self.cut_engine {
            ctx.call("actions", "cutEngine", &[]).await?;
        }
        Ok(true)
    }
}

/// Engine preloaded with the jammer rules.
pub fn jammer_engine(cut_engine: bool) -> SequentialRuleEngine {
    SequentialRuleEngine::new()
        .with_rule(Box::new(PositionInvalidRule))
        .with_rule(Box::new(WeakSignalRule))
        .with_rule(Box::new(JammerAlertRule { cut_engine }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_orders_rules() {
        let engine = jammer_engine(false);
        assert_eq!(
            engine.rule_names(),
            vec!["position_invalid", "moving_with_weak_signal", "jammer_alert"]
        );
    }

    #[test]
    fn thresholds_fill_missing_fields_with_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let parsed: JammerThresholds = serde_json::from_str(r#"{"offline_minutes": 7}"#)?;
        assert_eq!(parsed.offline_minutes, 7);
        assert_eq!(parsed.min_avg_speed, 10);
        assert_eq!(parsed.max_avg_signal, 15);
        Ok(())
    }
}
