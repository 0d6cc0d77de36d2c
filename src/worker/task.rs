//! Task and outcome types.

use crate::hardware::PortId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Command kinds understood by the worker.
///
/// Parsing is case-insensitive. Anything unrecognised becomes
/// [`CommandKind::Unknown`] so it can be reported instead of rejected at the
/// queue boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandKind {
    /// Poll and persist a reading
    Monitor,
    /// Program a voltage directly
    SetVoltage,
    /// Enable the output
    TurnOn,
    /// Ramp down to the safe floor, then disable the output
    TurnOff,
    /// Reset the device
    Reset,
    /// Ramp to a target voltage
    RampVoltage,
    /// Program a current limit
    SetCurrent,
    /// Enable over-current protection
    EnableOcp,
    /// Disable over-current protection
    DisableOcp,
    /// Clear a protection trip
    ClearTrip,
    /// Pass a command string through unchanged
    Raw,
    /// Unrecognised command name
    Unknown(String),
}

impl CommandKind {
    /// Wire name, e.g. `RAMP_VOLTAGE`.
    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::Monitor => "MONITOR",
            CommandKind::SetVoltage => "SET_VOLTAGE",
            CommandKind::TurnOn => "TURN_ON",
            CommandKind::TurnOff => "TURN_OFF",
            CommandKind::Reset => "RESET",
            CommandKind::RampVoltage => "RAMP_VOLTAGE",
            CommandKind::SetCurrent => "SET_CURRENT",
            CommandKind::EnableOcp => "ENABLE_OCP",
            CommandKind::DisableOcp => "DISABLE_OCP",
            CommandKind::ClearTrip => "CLEAR_TRIP",
            CommandKind::Raw => "RAW",
            CommandKind::Unknown(name) => name,
        }
    }
}

impl From<&str> for CommandKind {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "MONITOR" => CommandKind::Monitor,
            "SET_VOLTAGE" => CommandKind::SetVoltage,
            "TURN_ON" => CommandKind::TurnOn,
            "TURN_OFF" => CommandKind::TurnOff,
            "RESET" => CommandKind::Reset,
            "RAMP_VOLTAGE" => CommandKind::RampVoltage,
            "SET_CURRENT" => CommandKind::SetCurrent,
            "ENABLE_OCP" => CommandKind::EnableOcp,
            "DISABLE_OCP" => CommandKind::DisableOcp,
            "CLEAR_TRIP" => CommandKind::ClearTrip,
            "RAW" => CommandKind::Raw,
            _ => CommandKind::Unknown(value.to_string()),
        }
    }
}

impl From<String> for CommandKind {
    fn from(value: String) -> Self {
        CommandKind::from(value.as_str())
    }
}

impl From<CommandKind> for String {
    fn from(value: CommandKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work for the command worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Target port
    pub port_id: PortId,
    /// What to do
    pub command: CommandKind,
    /// Voltage or current argument
    #[serde(default)]
    pub value: Option<f64>,
    /// Ramp step count override
    #[serde(default)]
    pub ramp_steps: Option<u32>,
    /// Inter-step delay override in milliseconds
    #[serde(default)]
    pub ramp_delay_ms: Option<u64>,
    /// Command string for RAW
    #[serde(default)]
    pub raw_command: Option<String>,
}

impl Task {
    /// Task without arguments.
    pub fn new(port_id: PortId, command: impl Into<CommandKind>) -> Self {
        Self {
            port_id,
            command: command.into(),
            value: None,
            ramp_steps: None,
            ramp_delay_ms: None,
            raw_command: None,
        }
    }

    /// MONITOR task.
    pub fn monitor(port_id: PortId) -> Self {
        Self::new(port_id, CommandKind::Monitor)
    }

    /// Task carrying a numeric argument.
    pub fn with_value(port_id: PortId, command: impl Into<CommandKind>, value: f64) -> Self {
        Self {
            value: Some(value),
            ..Self::new(port_id, command)
        }
    }

    /// RAMP_VOLTAGE task with optional overrides.
    pub fn ramp(port_id: PortId, target: f64, steps: Option<u32>, delay_ms: Option<u64>) -> Self {
        Self {
            ramp_steps: steps,
            ramp_delay_ms: delay_ms,
            ..Self::with_value(port_id, CommandKind::RampVoltage, target)
        }
    }

    /// RAW task.
    pub fn raw(port_id: PortId, command: impl Into<String>) -> Self {
        Self {
            raw_command: Some(command.into()),
            ..Self::new(port_id, CommandKind::Raw)
        }
    }

    /// Action-log description, e.g. `SET_VOLTAGE: 55V`.
    pub fn description(&self) -> String {
        let value = |unit: &str| match self.value {
            Some(v) => format!("{}: {}{}", self.command, v, unit),
            None => self.command.to_string(),
        };

        match &self.command {
            CommandKind::SetVoltage => value("V"),
            CommandKind::SetCurrent | CommandKind::EnableOcp => value("A"),
            CommandKind::TurnOff => "TURN_OFF (with Ramp Down)".to_string(),
            CommandKind::RampVoltage => match self.value {
                Some(v) => format!("RAMP_VOLTAGE to {}V", v),
                None => "RAMP_VOLTAGE".to_string(),
            },
            CommandKind::Raw => format!("RAW: {}", self.raw_command.as_deref().unwrap_or("")),
            other => other.to_string(),
        }
    }
}

/// Terminal result of one task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Device response
    Success(String),
    /// The device lacks the required capability
    NotSupported,
    /// The command name was not recognised
    UnknownCommand(String),
    /// The port is absent or failed; nothing was attempted
    Rejected(String),
    /// Device error, missing argument or caught panic
    Failed(String),
}

impl TaskOutcome {
    /// Returns `true` for [`TaskOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }

    /// Text written to the action log for this outcome.
    pub fn log_text(&self, command: &CommandKind) -> String {
        match self {
            TaskOutcome::Success(response) => response.clone(),
            TaskOutcome::NotSupported => format!("{} not supported by this device", command),
            TaskOutcome::UnknownCommand(name) => format!("Unknown command: {}", name),
            TaskOutcome::Rejected(reason) => format!("REJECTED: {}", reason),
            TaskOutcome::Failed(reason) => format!("ERROR executing {}: {}", command, reason),
        }
    }
}

/// A processed task and its outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTask {
    /// The task as dequeued
    pub task: Task,
    /// What happened
    pub outcome: TaskOutcome,
}
