// Control commands and their tracked outcome
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveAction {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmAction {
    Acknowledge,
    Reset,
}

/// A user intent addressed to one piece of equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlCommand {
    DeviceControl {
        device_name: String,
        action: DeviceAction,
    },
    ValveControl {
        valve_name: String,
        action: ValveAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        open_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        close_key: Option<String>,
    },
    SetFrequency {
        device_name: String,
        frequency: f64,
    },
    ProcessControl {
        parameter_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lower_limit: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upper_limit: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        coefficient: Option<f64>,
    },
    AlarmControl {
        alarm_name: String,
        action: AlarmAction,
    },
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid command: {0}")]
pub struct InvalidCommand(pub String);

impl ControlCommand {
    /// Name of the equipment the command addresses; pending state is keyed by it.
    pub fn target(&self) -> &str {
        match self {
            ControlCommand::DeviceControl { device_name, .. } => device_name,
            ControlCommand::ValveControl { valve_name, .. } => valve_name,
            ControlCommand::SetFrequency { device_name, .. } => device_name,
            ControlCommand::ProcessControl { parameter_name, .. } => parameter_name,
            ControlCommand::AlarmControl { alarm_name, .. } => alarm_name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControlCommand::DeviceControl { .. } => "device_control",
            ControlCommand::ValveControl { .. } => "valve_control",
            ControlCommand::SetFrequency { .. } => "set_frequency",
            ControlCommand::ProcessControl { .. } => "process_control",
            ControlCommand::AlarmControl { .. } => "alarm_control",
        }
    }

    pub fn validate(&self) -> Result<(), InvalidCommand> {
        if self.target().trim().is_empty() {
            return Err(InvalidCommand(format!("{} requires a target name", self.kind())));
        }

        match self {
            ControlCommand::SetFrequency { frequency, .. } => {
                if !frequency.is_finite() || *frequency < 0.0 {
                    return Err(InvalidCommand(format!("frequency {} Hz is out of range", frequency)));
                }
            }
            ControlCommand::ProcessControl {
                value,
                lower_limit,
                upper_limit,
                coefficient,
                ..
            } => {
                let fields = [value, lower_limit, upper_limit, coefficient];
                if fields.iter().all(|f| f.is_none()) {
                    return Err(InvalidCommand("process_control changes nothing".to_string()));
                }
                // Process values are signed (ORP limits sit below zero)
                if fields.iter().filter_map(|f| **f).any(|v| !v.is_finite()) {
                    return Err(InvalidCommand("process values must be finite".to_string()));
                }
                if let (Some(lower), Some(upper)) = (lower_limit, upper_limit) {
                    if lower > upper {
                        return Err(InvalidCommand(format!(
                            "lower limit {} exceeds upper limit {}",
                            lower, upper
                        )));
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Category recorded in the operation journal.
    pub fn operation_type(&self) -> &'static str {
        match self {
            ControlCommand::DeviceControl { .. } => "device control",
            ControlCommand::ValveControl { .. } => "valve control",
            ControlCommand::SetFrequency { .. } => "frequency setting",
            ControlCommand::ProcessControl { .. } => "process tuning",
            ControlCommand::AlarmControl { .. } => "alarm handling",
        }
    }

    /// Human readable description recorded in the operation journal.
    pub fn describe(&self) -> String {
        match self {
            ControlCommand::DeviceControl { action, .. } => match action {
                DeviceAction::Start => "start device".to_string(),
                DeviceAction::Stop => "stop device".to_string(),
            },
            ControlCommand::ValveControl { action, .. } => match action {
                ValveAction::Open => "open valve".to_string(),
                ValveAction::Close => "close valve".to_string(),
            },
            ControlCommand::SetFrequency { frequency, .. } => {
                format!("set frequency to {} Hz", frequency)
            }
            ControlCommand::ProcessControl {
                value,
                lower_limit,
                upper_limit,
                coefficient,
                ..
            } => {
                let mut changes = Vec::new();
                if let Some(v) = value {
                    changes.push(format!("value={}", v));
                }
                if let Some(v) = lower_limit {
                    changes.push(format!("lower={}", v));
                }
                if let Some(v) = upper_limit {
                    changes.push(format!("upper={}", v));
                }
                if let Some(v) = coefficient {
                    changes.push(format!("coefficient={}", v));
                }
                format!("tune parameter ({})", changes.join(", "))
            }
            ControlCommand::AlarmControl { action, .. } => match action {
                AlarmAction::Acknowledge => "acknowledge alarm".to_string(),
                AlarmAction::Reset => "reset alarm".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Success,
    Error,
    Timeout,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        self != CommandStatus::Pending
    }
}

/// A dispatched command awaiting (or having received) confirmation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommand {
    pub target_name: String,
    pub correlation_id: String,
    pub status: CommandStatus,
    pub message: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl PendingCommand {
    pub fn new(target_name: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            correlation_id: correlation_id.into(),
            status: CommandStatus::Pending,
            message: None,
            issued_at: Utc::now(),
        }
    }
}
