//! Assembly of the standard capability set.

use std::sync::Arc;
use std::time::Duration;

use trackguard_kernel::dispatch::DEFAULT_PROTOCOL;
use trackguard_kernel::geofence::{DEFAULT_SAFE_ZONES, DEFAULT_STORE_TIMEOUT};
use trackguard_kernel::{
    AlertAuditSink, AlertsCapability, BufferCapability, Capability, CapabilityRegistry, CommandDispatch,
    GeofenceCapability, GeofenceStore, MetricsCapability, Notifier, TimingCapability,
};
use trackguard_middleware::EventBus;
use trackguard_types::TrackError;

/// Knobs for [`StandardCapabilities::new`].
#[derive(Debug, Clone)]
pub struct CapabilityOptions {
    pub store_timeout: Duration,
    /// Groups reported in the geofence audit snapshot.
    pub audit_groups: Vec<String>,
    pub protocol: String,
    /// Device-count bound for the buffer; `None` is unbounded.
    pub max_buffered_devices: Option<usize>,
}

impl Default for CapabilityOptions {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            audit_groups: DEFAULT_SAFE_ZONES.iter().map(|g| g.to_string()).collect(),
            protocol: DEFAULT_PROTOCOL.to_string(),
            max_buffered_devices: None,
        }
    }
}

/// Typed handles to every built-in capability.
pub struct StandardCapabilities {
    pub buffer: Arc<BufferCapability>,
    pub timing: Arc<TimingCapability>,
    pub geofence: Arc<GeofenceCapability>,
    pub metrics: Arc<MetricsCapability>,
    pub alerts: Arc<AlertsCapability>,
    pub dispatch: Arc<CommandDispatch>,
}

impl StandardCapabilities {
    pub fn new(
        store: Arc<dyn GeofenceStore>,
        notifier: Arc<dyn Notifier>,
        bus: EventBus,
        options: CapabilityOptions,
    ) -> Self {
        Self::assemble(store, notifier, bus, options, None)
    }

    /// Like [`StandardCapabilities::new`], and every won alert claim is
    /// written to `audit` with the buffer, timing, geofence and metrics
    /// snapshots of the device.
    pub fn with_alert_audit(
        store: Arc<dyn GeofenceStore>,
        notifier: Arc<dyn Notifier>,
        bus: EventBus,
        options: CapabilityOptions,
        audit: Arc<dyn AlertAuditSink>,
    ) -> Self {
        Self::assemble(store, notifier, bus, options, Some(audit))
    }

    fn assemble(
        store: Arc<dyn GeofenceStore>,
        notifier: Arc<dyn Notifier>,
        bus: EventBus,
        options: CapabilityOptions,
        audit: Option<Arc<dyn AlertAuditSink>>,
    ) -> Self {
        let buffer = Arc::new(match options.max_buffered_devices {
            Some(max) => BufferCapability::with_max_devices(max),
            None => BufferCapability::new(),
        });
        let timing = Arc::new(TimingCapability::new());
        let geofence = Arc::new(
            GeofenceCapability::new(store)
                .with_store_timeout(options.store_timeout)
                .with_audit_groups(options.audit_groups),
        );
        let metrics = Arc::new(MetricsCapability::new(Arc::clone(&buffer)));

        let mut alerts = AlertsCapability::new(Arc::clone(&notifier));
        if let Some(sink) = audit {
            let sources = vec![
                buffer.clone() as Arc<dyn Capability>,
                timing.clone() as Arc<dyn Capability>,
                geofence.clone() as Arc<dyn Capability>,
                metrics.clone() as Arc<dyn Capability>,
            ];
            alerts = alerts.with_audit_sink(sink, sources);
        }

        Self {
            buffer,
            timing,
            geofence,
            metrics,
            alerts: Arc::new(alerts),
            dispatch: Arc::new(CommandDispatch::new(bus, notifier, options.protocol)),
        }
    }

    /// Registry in update order: buffer, timing, geofence, metrics, alerts,
    /// commands.
    pub fn registry(&self) -> Result<CapabilityRegistry, TrackError> {
        let mut registry = CapabilityRegistry::new();
        registry.register(self.buffer.clone())?;
        registry.register(self.timing.clone())?;
        registry.register(self.geofence.clone())?;
        registry.register(self.metrics.clone())?;
        registry.register(self.alerts.clone())?;
        registry.register(self.dispatch.clone())?;
        Ok(registry)
    }
}
