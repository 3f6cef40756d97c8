//! `trackguard-middleware` – message plumbing around the evaluation core.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe bus built on Tokio
//!   broadcast channels.
//! - [`adapter`] – turns normalised telemetry JSON into typed
//!   [`IncomingPacket`][trackguard_types::IncomingPacket]s.

pub mod adapter;
pub mod bus;

pub use adapter::{GpsTrackerAdapter, PacketAdapter};
pub use bus::{EventBus, Topic, TopicReceiver};
