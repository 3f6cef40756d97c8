//! The [`Capability`] contract.
//!
//! A capability is a named, versioned unit of per-device state plus the
//! query/action operations the rule engine may call on it. The registry and
//! the binding context depend only on this trait, never on concrete types.
//!
//! | Hook | Phase | Purpose |
//! |---|---|---|
//! | [`Capability::observe`] | update | fold the incoming packet into state |
//! | [`Capability::initialize`] | context build | prepare per-device state |
//! | [`Capability::invoke`] | rule evaluation | dynamic binding surface |
//! | [`AuditContributor::audit_snapshot`] | after evaluation | observability |

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use trackguard_types::{IncomingPacket, TrackError};

/// Description of one invokable operation, published in the manifest.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FunctionDescriptor {
    pub name: &'static str,
    pub args: &'static [&'static str],
    pub returns: &'static str,
    pub description: &'static str,
}

/// Every capability exposed to the rule engine implements this trait.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Unique registry name, e.g. `"buffer"`.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// Binding name the rule engine sees, e.g. `"geo"`. Several capabilities
    /// may share one binding name.
    fn context_name(&self) -> &str;

    /// Prepare state for `imei`. Called once per evaluation cycle, so it
    /// must be idempotent.
    async fn initialize(&self, imei: &str);

    /// Capability-wide summary (device counts, configuration).
    async fn snapshot(&self) -> Value;

    /// Update-phase hook. Returns whether the packet changed this
    /// capability's state. Default: the capability keeps no packet state.
    async fn observe(&self, _packet: &IncomingPacket) -> bool {
        false
    }

    /// Call `operation` for `imei` with JSON arguments.
    async fn invoke(&self, imei: &str, operation: &str, args: &[Value]) -> Result<Value, TrackError>;

    /// Operations accepted by [`Capability::invoke`].
    fn functions(&self) -> &'static [FunctionDescriptor];

    /// Opt-in audit contribution.
    fn as_audit(&self) -> Option<&dyn AuditContributor> {
        None
    }
}

/// Optional second interface: per-device audit snapshot.
#[async_trait]
pub trait AuditContributor: Send + Sync {
    async fn audit_snapshot(&self, imei: &str) -> Option<Value>;
}

// ────────────────────────────────────────────────────────────────────────────
// Argument helpers for `invoke` implementations
// ────────────────────────────────────────────────────────────────────────────

fn missing(operation: &str, index: usize, expected: &str) -> TrackError {
    TrackError::InvalidArgument {
        operation: operation.to_string(),
        details: format!("argument {index} must be {expected}"),
    }
}

/// Argument `index` as an integer. Whole-valued floats are accepted.
pub fn arg_i64(operation: &str, args: &[Value], index: usize) -> Result<i64, TrackError> {
    match args.get(index) {
        Some(v) if v.is_i64() => v.as_i64().ok_or_else(|| missing(operation, index, "an integer")),
        Some(v) => match v.as_f64() {
            Some(f) if f.fract() == 0.0 => Ok(f as i64),
            _ => Err(missing(operation, index, "an integer")),
        },
        None => Err(missing(operation, index, "an integer")),
    }
}

pub fn arg_f64(operation: &str, args: &[Value], index: usize) -> Result<f64, TrackError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| missing(operation, index, "a number"))
}

pub fn arg_str<'a>(operation: &str, args: &'a [Value], index: usize) -> Result<&'a str, TrackError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(operation, index, "a string"))
}

pub fn arg_str_list(operation: &str, args: &[Value], index: usize) -> Result<Vec<String>, TrackError> {
    let list = args
        .get(index)
        .and_then(Value::as_array)
        .ok_or_else(|| missing(operation, index, "a list of strings"))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| missing(operation, index, "a list of strings"))
        })
        .collect()
}

/// Error for an operation a capability does not expose.
pub fn unknown_operation(binding: &str, operation: &str) -> TrackError {
    TrackError::UnknownOperation {
        binding: binding.to_string(),
        operation: operation.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_arguments_accept_whole_floats() {
        let args = [json!(5), json!(7.0), json!(2.5), json!("x")];
        assert_eq!(arg_i64("op", &args, 0), Ok(5));
        assert_eq!(arg_i64("op", &args, 1), Ok(7));
        assert!(arg_i64("op", &args, 2).is_err());
        assert!(arg_i64("op", &args, 3).is_err());
        assert!(arg_i64("op", &args, 9).is_err());
    }

    #[test]
    fn string_list_argument() {
        let args = [json!(["Taller", "CLIENTES"]), json!([1, 2])];
        assert_eq!(
            arg_str_list("op", &args, 0),
            Ok(vec!["Taller".to_string(), "CLIENTES".to_string()])
        );
        assert!(matches!(
            arg_str_list("op", &args, 1),
            Err(TrackError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn float_and_string_arguments() {
        let args = [json!(19.5), json!("CLIENTES")];
        assert_eq!(arg_f64("op", &args, 0), Ok(19.5));
        assert_eq!(arg_str("op", &args, 1), Ok("CLIENTES"));
        assert!(arg_str("op", &args, 0).is_err());
    }
}
