//! [`CapabilityRegistry`] – collects capabilities and builds the per-cycle
//! [`BindingContext`] handed to the rule engine.
//!
//! The registry is the only place where typed capability state meets the
//! dynamic, name-addressed binding surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;
use trackguard_types::{IncomingPacket, TrackError};

use crate::capability::Capability;

/// Registered capabilities, in registration order.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: Vec<Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `capability`.
    ///
    /// # Errors
    ///
    /// [`TrackError::CapabilityExists`] when a capability with the same name
    /// is already registered.
    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<(), TrackError> {
        if self.get(capability.name()).is_some() {
            return Err(TrackError::CapabilityExists(capability.name().to_string()));
        }
        debug!(
            capability = capability.name(),
            binding = capability.context_name(),
            "capability registered"
        );
        self.capabilities.push(capability);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.iter().find(|c| c.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.capabilities.iter().map(|c| c.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Update phase: fold `packet` into every capability, in registration
    /// order.
    ///
    /// Returns the names of the capabilities that accepted the packet into
    /// their state, in registration order.
    pub async fn update(&self, packet: &IncomingPacket) -> Vec<String> {
        let mut accepted = Vec::new();
        for capability in &self.capabilities {
            if capability.observe(packet).await {
                accepted.push(capability.name().to_string());
            }
        }
        accepted
    }

    /// Initialise every capability for `imei` and bind them by context name.
    pub async fn build_context(&self, imei: &str) -> BindingContext {
        let mut bindings: BTreeMap<String, Vec<Arc<dyn Capability>>> = BTreeMap::new();
        for capability in &self.capabilities {
            capability.initialize(imei).await;
            bindings
                .entry(capability.context_name().to_string())
                .or_default()
                .push(Arc::clone(capability));
        }
        BindingContext {
            imei: imei.to_string(),
            bindings,
        }
    }

    /// Merge every audit contribution for `imei`, keyed by capability name.
    pub async fn snapshot(&self, imei: &str) -> Value {
        let mut merged = Map::new();
        merged.insert("imei".into(), Value::String(imei.to_string()));
        for capability in &self.capabilities {
            if let Some(audit) = capability.as_audit() {
                if let Some(contribution) = audit.audit_snapshot(imei).await {
                    merged.insert(capability.name().to_string(), contribution);
                }
            }
        }
        Value::Object(merged)
    }

    /// Capability-wide summaries, keyed by capability name.
    pub async fn status(&self) -> Value {
        let mut out = Map::new();
        for capability in &self.capabilities {
            out.insert(capability.name().to_string(), capability.snapshot().await);
        }
        Value::Object(out)
    }

    /// Binding description for rule authors: every capability with its
    /// operations, plus the JSON schema of `IncomingPacket`.
    pub fn manifest(&self) -> Value {
        let capabilities: Vec<Value> = self
            .capabilities
            .iter()
            .map(|c| {
                json!({
                    "name": c.name(),
                    "version": c.version(),
                    "binding": c.context_name(),
                    "functions": c.functions(),
                })
            })
            .collect();
        json!({
            "capabilities": capabilities,
            "packet": schemars::schema_for!(IncomingPacket),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// BindingContext
// ────────────────────────────────────────────────────────────────────────────

/// Per-cycle set of named capability handles for one device.
pub struct BindingContext {
    imei: String,
    bindings: BTreeMap<String, Vec<Arc<dyn Capability>>>,
}

impl BindingContext {
    pub fn imei(&self) -> &str {
        &self.imei
    }

    /// Bound names, sorted.
    pub fn bindings(&self) -> Vec<&str> {
        self.bindings.keys().map(String::as_str).collect()
    }

    pub fn has_binding(&self, binding: &str) -> bool {
        self.bindings.contains_key(binding)
    }

    /// Invoke `operation` on the first capability under `binding` whose
    /// manifest lists it.
    pub async fn call(&self, binding: &str, operation: &str, args: &[Value]) -> Result<Value, TrackError> {
        let candidates = self
            .bindings
            .get(binding)
            .ok_or_else(|| TrackError::UnknownBinding(binding.to_string()))?;
        let target = candidates
            .iter()
            .find(|c| c.functions().iter().any(|f| f.name == operation))
            .ok_or_else(|| TrackError::UnknownOperation {
                binding: binding.to_string(),
                operation: operation.to_string(),
            })?;
        target.invoke(&self.imei, operation, args).await
    }

    /// [`BindingContext::call`] expecting a boolean result.
    pub async fn call_bool(&self, binding: &str, operation: &str, args: &[Value]) -> Result<bool, TrackError> {
        let value = self.call(binding, operation, args).await?;
        value.as_bool().ok_or_else(|| unexpected(binding, operation, "bool", &value))
    }

    /// [`BindingContext::call`] expecting an integer result.
    pub async fn call_i64(&self, binding: &str, operation: &str, args: &[Value]) -> Result<i64, TrackError> {
        let value = self.call(binding, operation, args).await?;
        value.as_i64().ok_or_else(|| unexpected(binding, operation, "integer", &value))
    }
}

fn unexpected(binding: &str, operation: &str, expected: &str, got: &Value) -> TrackError {
    TrackError::InvalidArgument {
        operation: format!("{binding}.{operation}"),
        details: format!("expected {expected} result, got {got}"),
    }
}
