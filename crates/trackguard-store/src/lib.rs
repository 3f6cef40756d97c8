//! `trackguard-store` – SQLite persistence.
//!
//! - [`geofence_store`] – [`SqliteGeofenceStore`]: geofences, named groups
//!   and the group mapping table in a local SQLite database, implementing
//!   the kernel's [`GeofenceStore`][trackguard_kernel::GeofenceStore].
//! - [`alert_audit`] – [`SqliteAlertAuditStore`]: one row per won alert
//!   claim, implementing [`AlertAuditSink`][trackguard_kernel::AlertAuditSink].

pub mod alert_audit;
pub mod geofence_store;

pub use alert_audit::SqliteAlertAuditStore;
pub use geofence_store::{SqliteGeofenceStore, StoreError};
