//! `trackguard-runtime` – evaluation cycle, rules and worker.
//!
//! # Modules
//!
//! - [`capabilities`] – [`StandardCapabilities`]: the built-in capability set
//!   wired into a [`CapabilityRegistry`][trackguard_kernel::CapabilityRegistry].
//! - [`rules`] – [`Rule`] / [`RuleEngine`] boundary and the
//!   [`SequentialRuleEngine`].
//! - [`jammer`] – the jammer-detection rule set.
//! - [`evaluator`] – [`Evaluator`]: adapter, update phase, flags, rules and
//!   audit snapshot for each packet.
//! - [`worker`] – [`Worker`]: bounded-concurrency consumer of the telemetry
//!   topic.
//! - [`telemetry`] – [`init_tracing`]: log and trace export setup.

pub mod capabilities;
pub mod evaluator;
pub mod jammer;
pub mod rules;
pub mod telemetry;
pub mod worker;

pub use capabilities::{CapabilityOptions, StandardCapabilities};
pub use evaluator::{EvaluationReport, Evaluator, EvaluatorConfig};
pub use jammer::{JammerThresholds, jammer_engine};
pub use rules::{Rule, RuleEngine, SequentialRuleEngine};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use worker::{Worker, WorkerProgress, WorkerStats};
