//! Buffer capability – per-device sliding time window of recent fixes.
//!
//! Each device owns an ordered window covering the trailing
//! [`WINDOW_MINUTES`] relative to its newest fix. Fixes that are not strictly
//! newer than the window's tail are discarded, so insertion order is always
//! chronological.
//!
//! Locking is two-level: the device map is locked only to look up or create
//! a slot, and each slot carries its own `RwLock`, so devices never contend
//! with each other.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use trackguard_types::{BufferEntry, IncomingPacket, TrackError};

use crate::capability::{AuditContributor, Capability, FunctionDescriptor, arg_i64, unknown_operation};

/// Trailing span kept per device.
pub const WINDOW_MINUTES: i64 = 90;

fn window() -> TimeDelta {
    TimeDelta::minutes(WINDOW_MINUTES)
}

struct DeviceSlot {
    last_touched: AtomicU64,
    entries: RwLock<VecDeque<BufferEntry>>,
}

impl DeviceSlot {
    fn new(tick: u64) -> Self {
        Self {
            last_touched: AtomicU64::new(tick),
            entries: RwLock::new(VecDeque::new()),
        }
    }
}

/// Sliding-window cache, bound as `"buffer"`.
#[derive(Default)]
pub struct BufferCapability {
    devices: RwLock<HashMap<String, Arc<DeviceSlot>>>,
    /// Optional device-count bound; least-recently-updated windows go first.
    max_devices: Option<usize>,
    clock: AtomicU64,
}

const FUNCTIONS: &[FunctionDescriptor] = &[
    FunctionDescriptor {
        name: "entriesInWindow",
        args: &[],
        returns: "BufferEntry[]",
        description: "Entries within the trailing 90 minutes, oldest first",
    },
    FunctionDescriptor {
        name: "hasAtLeast",
        args: &["n: int"],
        returns: "bool",
        description: "Whether the window holds at least n entries",
    },
    FunctionDescriptor {
        name: "len",
        args: &[],
        returns: "int",
        description: "Number of entries currently in the window",
    },
    FunctionDescriptor {
        name: "newestTimestamp",
        args: &[],
        returns: "datetime?",
        description: "Timestamp of the window's newest entry",
    },
];

impl BufferCapability {
    /// Unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer holding at most `max_devices` windows.
    ///
    /// A window that is being read or written when a new device arrives is
    /// never evicted; the bound may then be exceeded until a later insert.
    pub fn with_max_devices(max_devices: usize) -> Self {
        Self {
            max_devices: Some(max_devices.max(1)),
            ..Self::default()
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    async fn slot(&self, imei: &str) -> Option<Arc<DeviceSlot>> {
        self.devices.read().await.get(imei).cloned()
    }

    async fn slot_or_create(&self, imei: &str) -> Arc<DeviceSlot> {
        if let Some(slot) = self.slot(imei).await {
            return slot;
        }
        let mut devices = self.devices.write().await;
        if let Some(slot) = devices.get(imei) {
            return Arc::clone(slot);
        }
        if let Some(max) = self.max_devices {
            while devices.len() >= max {
                // Under the write lock no new handle can be taken, so a slot
                // referenced only by the map has no read or write in flight.
                let oldest_idle = devices
                    .iter()
                    .filter(|(_, slot)| Arc::strong_count(slot) == 1)
                    .min_by_key(|(_, slot)| slot.last_touched.load(Ordering::Relaxed))
                    .map(|(id, _)| id.clone());
                match oldest_idle {
                    Some(id) => {
                        debug!(imei = %id, "evicting least recently updated buffer window");
                        devices.remove(&id);
                    }
                    None => {
                        debug!(
                            devices = devices.len(),
                            max,
                            "every buffer window is in use, device bound exceeded until the next eviction"
                        );
                        break;
                    }
                }
            }
        }
        let slot = Arc::new(DeviceSlot::new(self.tick()));
        devices.insert(imei.to_string(), Arc::clone(&slot));
        slot
    }

    /// Append `entry` to the device's window and evict entries older than
    /// the window relative to it.
    ///
    /// Returns `false` when the entry was discarded because it is not newer
    /// than the current tail.
    pub async fn record(&self, imei: &str, entry: BufferEntry) -> bool {
        let slot = self.slot_or_create(imei).await;
        slot.last_touched.store(self.tick(), Ordering::Relaxed);

        let mut entries = slot.entries.write().await;
        if let Some(last) = entries.back() {
            if entry.datetime <= last.datetime {
                warn!(
                    imei = %imei,
                    last = %last.datetime,
                    incoming = %entry.datetime,
                    "discarding stale or duplicate fix"
                );
                return false;
            }
        }
        let cutoff = entry.datetime - window();
        entries.push_back(entry);
        while entries.front().is_some_and(|e| e.datetime < cutoff) {
            entries.pop_front();
        }
        true
    }

    /// Window contents, oldest first. Unknown devices yield an empty window.
    pub async fn entries_in_window(&self, imei: &str) -> Vec<BufferEntry> {
        let Some(slot) = self.slot(imei).await else {
            return Vec::new();
        };
        let entries = slot.entries.read().await;
        let Some(newest) = entries.back() else {
            return Vec::new();
        };
        let cutoff = newest.datetime - window();
        entries.iter().filter(|e| e.datetime >= cutoff).cloned().collect()
    }

    pub async fn len(&self, imei: &str) -> usize {
        match self.slot(imei).await {
            Some(slot) => slot.entries.read().await.len(),
            None => 0,
        }
    }

    pub async fn newest(&self, imei: &str) -> Option<DateTime<Utc>> {
        let slot = self.slot(imei).await?;
        let entries = slot.entries.read().await;
        entries.back().map(|e| e.datetime)
    }

    pub async fn has_at_least(&self, imei: &str, n: usize) -> bool {
        self.len(imei).await >= n
    }

    /// Number of devices with a window.
    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }
}

#[async_trait]
impl Capability for BufferCapability {
    fn name(&self) -> &str {
        "buffer"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn context_name(&self) -> &str {
        "buffer"
    }

    async fn initialize(&self, _imei: &str) {}

    async fn snapshot(&self) -> Value {
        json!({
            "devices": self.device_count().await,
            "window_minutes": WINDOW_MINUTES,
            "max_devices": self.max_devices,
        })
    }

    async fn observe(&self, packet: &IncomingPacket) -> bool {
        self.record(&packet.imei, BufferEntry::from(packet)).await
    }

    async fn invoke(&self, imei: &str, operation: &str, args: &[Value]) -> Result<Value, TrackError> {
        match operation {
            "entriesInWindow" => Ok(json!(self.entries_in_window(imei).await)),
            "hasAtLeast" => {
                let n = arg_i64(operation, args, 0)?.max(0) as usize;
                Ok(json!(self.has_at_least(imei, n).await))
            }
            "len" => Ok(json!(self.len(imei).await)),
            "newestTimestamp" => Ok(json!(self.newest(imei).await)),
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
impl AuditContributor for BufferCapability {
    async fn audit_snapshot(&self, imei: &str) -> Option<Value> {
        Some(json!({ "buffer_window": self.entries_in_window(imei).await }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::minutes(minute)
    }

    fn entry(imei: &str, minute: i64, speed: i64) -> BufferEntry {
        BufferEntry {
            imei: imei.to_string(),
            datetime: at(minute),
            speed,
            gsm_signal_strength: 20,
            positioning_status: "A".into(),
            is_valid: true,
            latitude: 0.0,
            longitude: 0.0,
        }
    }

    #[tokio::test]
    async fn unknown_device_has_empty_window() {
        let buffer = BufferCapability::new();
        assert!(buffer.entries_in_window("ghost").await.is_empty());
        assert!(!buffer.has_at_least("ghost", 1).await);
        assert!(buffer.has_at_least("ghost", 0).await);
    }

    #[tokio::test]
    async fn old_entries_are_evicted_relative_to_newest() {
        let buffer = BufferCapability::new();
        for minute in [0, 30, 60, 90, 100, 150] {
            assert!(buffer.record("a", entry("a", minute, minute)).await);
        }
        let window = buffer.entries_in_window("a").await;
        let minutes: Vec<i64> = window.iter().map(|e| e.speed).collect();
        assert_eq!(minutes, vec![60, 90, 100, 150]);

        let newest = window.last().map(|e| e.datetime).unwrap();
        assert!(window.iter().all(|e| newest - e.datetime <= super::window()));
    }

    #[tokio::test]
    async fn entry_exactly_at_window_edge_is_kept() {
        let buffer = BufferCapability::new();
        buffer.record("a", entry("a", 0, 1)).await;
        buffer.record("a", entry("a", 90, 2)).await;
        assert_eq!(buffer.len("a").await, 2);
    }

    #[tokio::test]
    async fn stale_and_duplicate_fixes_are_discarded() {
        let buffer = BufferCapability::new();
        assert!(buffer.record("a", entry("a", 10, 1)).await);
        assert!(!buffer.record("a", entry("a", 10, 2)).await);
        assert!(!buffer.record("a", entry("a", 5, 3)).await);
        assert!(buffer.record("a", entry("a", 11, 4)).await);

        let speeds: Vec<i64> = buffer.entries_in_window("a").await.iter().map(|e| e.speed).collect();
        assert_eq!(speeds, vec![1, 4]);
    }

    #[tokio::test]
    async fn devices_are_independent() {
        let buffer = BufferCapability::new();
        buffer.record("a", entry("a", 0, 1)).await;
        buffer.record("b", entry("b", 500, 2)).await;
        assert_eq!(buffer.len("a").await, 1);
        assert_eq!(buffer.len("b").await, 1);
        assert_eq!(buffer.device_count().await, 2);
    }

    #[tokio::test]
    async fn device_bound_evicts_least_recently_updated() {
        let buffer = BufferCapability::with_max_devices(2);
        buffer.record("a", entry("a", 0, 1)).await;
        buffer.record("b", entry("b", 0, 1)).await;
        buffer.record("a", entry("a", 1, 1)).await;
        buffer.record("c", entry("c", 0, 1)).await;

        assert_eq!(buffer.device_count().await, 2);
        assert_eq!(buffer.len("a").await, 2);
        assert_eq!(buffer.len("b").await, 0);
        assert_eq!(buffer.len("c").await, 1);
    }

    #[tokio::test]
    async fn window_in_use_is_not_evicted() {
        let buffer = BufferCapability::with_max_devices(1);
        buffer.record("a", entry("a", 0, 1)).await;

        let held = buffer.slot("a").await;
        assert!(buffer.record("b", entry("b", 0, 2)).await);
        assert_eq!(buffer.device_count().await, 2);
        assert_eq!(buffer.len("a").await, 1);

        drop(held);
        assert!(buffer.record("c", entry("c", 0, 3)).await);
        assert_eq!(buffer.device_count().await, 1);
        assert_eq!(buffer.len("c").await, 1);
    }

    #[tokio::test]
    async fn concurrent_recording_keeps_order() -> Result<(), Box<dyn std::error::Error>> {
        let buffer = Arc::new(BufferCapability::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let buffer = Arc::clone(&buffer);
            handles.push(tokio::spawn(async move {
                for minute in 0..50 {
                    buffer.record("shared", entry("shared", minute * 8 + worker, 0)).await;
                }
            }));
        }
        for handle in handles {
            handle.await?;
        }
        let window = buffer.entries_in_window("shared").await;
        assert!(!window.is_empty());
        assert!(window.windows(2).all(|pair| pair[0].datetime < pair[1].datetime));
        Ok(())
    }

    #[tokio::test]
    async fn binding_operations() -> Result<(), Box<dyn std::error::Error>> {
        let buffer = BufferCapability::new();
        buffer.record("a", entry("a", 0, 10)).await;
        buffer.record("a", entry("a", 1, 20)).await;

        assert_eq!(buffer.invoke("a", "len", &[]).await?, json!(2));
        assert_eq!(buffer.invoke("a", "newestTimestamp", &[]).await?, json!(at(1)));
        assert_eq!(buffer.invoke("b", "newestTimestamp", &[]).await?, Value::Null);
        assert_eq!(buffer.invoke("a", "hasAtLeast", &[json!(2)]).await?, json!(true));
        assert_eq!(buffer.invoke("a", "hasAtLeast", &[json!(3)]).await?, json!(false));
        let entries = buffer.invoke("a", "entriesInWindow", &[]).await?;
        assert_eq!(entries[1]["speed"], 20);
        assert!(buffer.invoke("a", "fly", &[]).await.is_err());

        let audit = buffer.audit_snapshot("a").await.unwrap_or_default();
        assert_eq!(audit["buffer_window"].as_array().map(Vec::len), Some(2));
        Ok(())
    }
}
