//! `trackguard-kernel` – capability framework and the stateful capabilities.
//!
//! # Modules
//!
//! | Module | Binding | Role |
//! |---|---|---|
//! | [`capability`] | | [`Capability`] / [`AuditContributor`] contract |
//! | [`registry`] | | [`CapabilityRegistry`] and per-cycle [`BindingContext`] |
//! | [`buffer`] | `buffer` | 90-minute sliding window per device |
//! | [`timing`] | `timing` | last-valid / current fix times, offline detection |
//! | [`geofence`] | `geo` | last position cache and group containment |
//! | [`metrics`] | `metrics` | rolling speed / signal averages |
//! | [`alerts`] | `actions` | at-most-once alert guard, claim audit trail and notifiers |
//! | [`dispatch`] | `actions` | device command publishing |

pub mod alerts;
pub mod buffer;
pub mod capability;
pub mod dispatch;
pub mod geofence;
pub mod metrics;
pub mod registry;
pub mod timing;

pub use alerts::{
    AlertAuditRecord, AlertAuditSink, AlertGuard, AlertsCapability, MemoryAlertAudit, Notifier,
    NotifierConfig, NullNotifier, RecordingNotifier, TelegramNotifier,
};
pub use buffer::BufferCapability;
pub use capability::{AuditContributor, Capability, FunctionDescriptor};
pub use dispatch::CommandDispatch;
pub use geofence::{GeofenceCapability, GeofenceStore, InMemoryGeofenceStore};
pub use metrics::MetricsCapability;
pub use registry::{BindingContext, CapabilityRegistry};
pub use timing::TimingCapability;
