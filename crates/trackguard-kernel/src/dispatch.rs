//! [`CommandDispatch`] – rule actions to device commands.
//!
//! Translates a symbolic [`DeviceAction`] into the vendor hex payload,
//! publishes it on [`Topic::DeviceCommands`], follows with the device →
//! transport association on [`Topic::DeviceAssign`], then notifies.
//!
//! # Encoding
//!
//! | Action | Suffix |
//! |---|---|
//! | `CutEngine` | `C00101` |
//! | `RestoreEngine` | `C00100` |
//! | `ActivateOutput(n)` | `C00{n}01` |
//! | `DeactivateOutput(n)` | `C00{n}00` |
//! | `Raw(hex)` | `hex` |
//!
//! The payload is [`COMMAND_PREFIX`] followed by the suffix. Outputs outside
//! `1..=8` are dropped without publishing or notifying.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, error, info};
use trackguard_middleware::{EventBus, Topic};
use trackguard_types::{AssignMessage, BusMessage, BusPayload, CommandMessage, DeviceAction, TrackError};

use crate::alerts::Notifier;
use crate::capability::{Capability, FunctionDescriptor, arg_i64, arg_str, unknown_operation};

/// Fixed header the command proxy expects before every suffix.
pub const COMMAND_PREFIX: &str = "313233343536373839303132";

pub const DEFAULT_PROTOCOL: &str = "meitrack";

const SOURCE: &str = "trackguard-kernel::dispatch";

/// Vendor suffix for `action`, or `None` for an output outside `1..=8`.
pub fn command_suffix(action: &DeviceAction) -> Option<String> {
    match action {
        DeviceAction::CutEngine => Some("C00101".to_string()),
        DeviceAction::RestoreEngine => Some("C00100".to_string()),
        DeviceAction::ActivateOutput(n) if (1..=8).contains(n) => Some(format!("C00{n}01")),
        DeviceAction::DeactivateOutput(n) if (1..=8).contains(n) => Some(format!("C00{n}00")),
        DeviceAction::ActivateOutput(_) | DeviceAction::DeactivateOutput(_) => None,
        DeviceAction::Raw(hex) => Some(hex.clone()),
    }
}

/// Publishes device commands. Also bound under `"actions"`.
pub struct CommandDispatch {
    bus: EventBus,
    notifier: Arc<dyn Notifier>,
    protocol: String,
}

const FUNCTIONS: &[FunctionDescriptor] = &[
    FunctionDescriptor {
        name: "cutEngine",
        args: &[],
        returns: "bool",
        description: "Energise relay 1 (engine cut)",
    },
    FunctionDescriptor {
        name: "restoreEngine",
        args: &[],
        returns: "bool",
        description: "Release relay 1",
    },
    FunctionDescriptor {
        name: "activateOutput",
        args: &["output: int (1-8)"],
        returns: "bool",
        description: "Switch an output on; out-of-range outputs are ignored",
    },
    FunctionDescriptor {
        name: "deactivateOutput",
        args: &["output: int (1-8)"],
        returns: "bool",
        description: "Switch an output off; out-of-range outputs are ignored",
    },
    FunctionDescriptor {
        name: "sendRawHex",
        args: &["hex: string"],
        returns: "bool",
        description: "Send a raw vendor command suffix",
    },
];

impl CommandDispatch {
    pub fn new(bus: EventBus, notifier: Arc<dyn Notifier>, protocol: impl Into<String>) -> Self {
        Self {
            bus,
            notifier,
            protocol: protocol.into(),
        }
    }

    /// Encode and publish `action` for `imei`.
    ///
    /// Returns the published command, or `None` when the action was dropped
    /// or the publish failed (both logged).
    pub async fn execute(&self, imei: &str, action: DeviceAction) -> Option<CommandMessage> {
        let Some(suffix) = command_suffix(&action) else {
            debug!(imei = %imei, ?action, "output out of range, command dropped");
            return None;
        };

        let command = CommandMessage {
            imei: imei.to_string(),
            payload: format!("{COMMAND_PREFIX}{suffix}"),
            remote_addr: String::new(),
        };
        let message = BusMessage::new(SOURCE, BusPayload::DeviceCommand(command.clone()));
        if let Err(e) = self.bus.publish_to(Topic::DeviceCommands, message) {
            error!(imei = %imei, error = %e, "failed to publish device command");
            return None;
        }

        let assign = AssignMessage {
            imei: imei.to_string(),
            protocol: self.protocol.clone(),
            remote_addr: String::new(),
        };
        if let Err(e) = self
            .bus
            .publish_to(Topic::DeviceAssign, BusMessage::new(SOURCE, BusPayload::DeviceAssign(assign)))
        {
            debug!(imei = %imei, error = %e, "no listener for device assignment");
        }

        info!(imei = %imei, suffix = %suffix, payload = %command.payload, "device command sent");
        self.notifier
            .notify(&format!("Comando enviado a {imei}: {suffix}"))
            .await;
        Some(command)
    }

    pub async fn cut_engine(&self, imei: &str) -> Option<CommandMessage> {
        self.execute(imei, DeviceAction::CutEngine).await
    }

    pub async fn restore_engine(&self, imei: &str) -> Option<CommandMessage> {
        self.execute(imei, DeviceAction::RestoreEngine).await
    }

    pub async fn activate_output(&self, imei: &str, output: i64) -> Option<CommandMessage> {
        self.execute(imei, DeviceAction::ActivateOutput(output_number(output)))
            .await
    }

    pub async fn deactivate_output(&self, imei: &str, output: i64) -> Option<CommandMessage> {
        self.execute(imei, DeviceAction::DeactivateOutput(output_number(output)))
            .await
    }

    pub async fn send_raw_hex(&self, imei: &str, hex: &str) -> Option<CommandMessage> {
        self.execute(imei, DeviceAction::Raw(hex.to_string())).await
    }
}

// Values that do not fit map to 0, which is out of range.
fn output_number(output: i64) -> u8 {
    u8::try_from(output).unwrap_or(0)
}

#[async_trait]
impl Capability for CommandDispatch {
    fn name(&self) -> &str {
        "commands"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn context_name(&self) -> &str {
        "actions"
    }

    async fn initialize(&self, _imei: &str) {}

    async fn snapshot(&self) -> Value {
        json!({ "protocol": self.protocol })
    }

    async fn invoke(&self, imei: &str, operation: &str, args: &[Value]) -> Result<Value, TrackError> {
        let sent = match operation {
            "cutEngine" => self.cut_engine(imei).await,
            "restoreEngine" => self.restore_engine(imei).await,
            "activateOutput" => self.activate_output(imei, arg_i64(operation, args, 0)?).await,
            "deactivateOutput" => self.deactivate_output(imei, arg_i64(operation, args, 0)?).await,
            "sendRawHex" => self.send_raw_hex(imei, arg_str(operation, args, 0)?).await,
            other => return Err(unknown_operation(self.context_name(), other)),
        };
        Ok(json!(sent.is_some()))
    }

    fn functions(&self) -> &'static [FunctionDescriptor] {
        FUNCTIONS
    }
}
