//! Metrics capability – derived statistics over the buffer window.
//!
//! Read-only: all state lives in [`BufferCapability`]. Means are truncated
//! toward zero.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use trackguard_types::{BufferEntry, TrackError};

use crate::buffer::BufferCapability;
use crate::capability::{AuditContributor, Capability, FunctionDescriptor, unknown_operation};

/// Number of trailing samples averaged by the signal statistic.
pub const SIGNAL_SAMPLES: usize = 5;

const FUNCTIONS: &[FunctionDescriptor] = &[
    FunctionDescriptor {
        name: "averageSpeed90Min",
        args: &[],
        returns: "int",
        description: "Mean speed (km/h) over the 90-minute window, 0 when empty",
    },
    FunctionDescriptor {
        name: "averageSignalLast5",
        args: &[],
        returns: "int",
        description: "Mean signal strength of the last 5 entries, 0 with fewer than 5",
    },
];

/// Mean speed over `entries`; 0 for an empty slice.
pub fn average_speed(entries: &[BufferEntry]) -> i64 {
    if entries.is_empty() {
        return 0;
    }
    entries.iter().map(|e| e.speed).sum::<i64>() / entries.len() as i64
}

/// Mean signal strength of the last [`SIGNAL_SAMPLES`] entries; 0 below that.
pub fn average_signal_last(entries: &[BufferEntry]) -> i64 {
    if entries.len() < SIGNAL_SAMPLES {
        return 0;
    }
    let tail = &entries[entries.len() - SIGNAL_SAMPLES..];
    tail.iter().map(|e| e.gsm_signal_strength).sum::<i64>() / SIGNAL_SAMPLES as i64
}

/// Rolling statistics, bound as `"metrics"`.
pub struct MetricsCapability {
    buffer: Arc<BufferCapability>,
}

impl MetricsCapability {
    pub fn new(buffer: Arc<BufferCapability>) -> Self {
        Self { buffer }
    }

    pub async fn average_speed_90_min(&self, imei: &str) -> i64 {
        average_speed(&self.buffer.entries_in_window(imei).await)
    }

    pub async fn average_signal_last_5(&self, imei: &str) -> i64 {
        average_signal_last(&self.buffer.entries_in_window(imei).await)
    }
}

#[async_trait]
impl Capability for MetricsCapability {
    fn name(&self) -> &str {
        "metrics"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn context_name(&self) -> &str {
        "metrics"
    }

    async fn initialize(&self, _imei: &str) {}

    async fn snapshot(&self) -> Value {
        json!({ "signal_samples": SIGNAL_SAMPLES })
    }

    async fn invoke(&self, imei: &str, operation: &str, _args: &[Value]) -> Result<Value, TrackError> {
        match operation {
            "averageSpeed90Min" => Ok(json!(self.average_speed_90_min(imei).await)),
            "averageSignalLast5" => Ok(json!(self.average_signal_last_5(imei).await)),
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
impl AuditContributor for MetricsCapability {
    async fn audit_snapshot(&self, imei: &str) -> Option<Value> {
        let entries = self.buffer.entries_in_window(imei).await;
        Some(json!({
            "jammer_metrics": {
                "avg_speed_90min": average_speed(&entries),
                "avg_gsm_last5": average_signal_last(&entries),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};

    async fn feed(buffer: &BufferCapability, samples: &[(i64, i64)]) {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (i, (speed, signal)) in samples.iter().enumerate() {
            buffer
                .record(
                    "a",
                    BufferEntry {
                        imei: "a".into(),
                        datetime: start + TimeDelta::minutes(i as i64),
                        speed: *speed,
                        gsm_signal_strength: *signal,
                        positioning_status: "A".into(),
                        is_valid: true,
                        latitude: 0.0,
                        longitude: 0.0,
                    },
                )
                .await;
        }
    }

    #[tokio::test]
    async fn empty_window_yields_zero() {
        let metrics = MetricsCapability::new(Arc::new(BufferCapability::new()));
        assert_eq!(metrics.average_speed_90_min("a").await, 0);
        assert_eq!(metrics.average_signal_last_5("a").await, 0);
    }

    #[tokio::test]
    async fn speed_mean_is_truncated() {
        let buffer = Arc::new(BufferCapability::new());
        feed(&buffer, &[(10, 0), (11, 0), (11, 0)]).await;
        let metrics = MetricsCapability::new(buffer);
        assert_eq!(metrics.average_speed_90_min("a").await, 10);
    }

    #[tokio::test]
    async fn signal_needs_five_entries() {
        let buffer = Arc::new(BufferCapability::new());
        feed(&buffer, &[(0, 30), (0, 30), (0, 30), (0, 30)]).await;
        let metrics = MetricsCapability::new(Arc::clone(&buffer));
        assert_eq!(metrics.average_signal_last_5("a").await, 0);
    }

    #[tokio::test]
    async fn signal_uses_exactly_the_last_five() -> Result<(), Box<dyn std::error::Error>> {
        let buffer = Arc::new(BufferCapability::new());
        feed(&buffer, &[(0, 99), (0, 99), (0, 10), (0, 11), (0, 12), (0, 13), (0, 15)]).await;
        let metrics = MetricsCapability::new(buffer);
        // (10 + 11 + 12 + 13 + 15) / 5 = 12.2
        assert_eq!(metrics.average_signal_last_5("a").await, 12);
        assert_eq!(metrics.invoke("a", "averageSignalLast5", &[]).await?, json!(12));

        let audit = metrics.audit_snapshot("a").await.ok_or("no audit")?;
        assert_eq!(audit["jammer_metrics"]["avg_gsm_last5"], 12);
        Ok(())
    }
}
