// Gateway wire protocol - inbound pushes and outbound requests
use crate::domain::command::ControlCommand;
use crate::domain::site::{
    DataGroup, DeviceState, FrequencyDrive, ProcessParameter, Record, SensorReading, ValveState,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Full or incremental state as pushed by the gateway (or returned by the HTTP API).
///
/// A present `data_groups` is an authoritative snapshot; the flat lists are
/// merged by item name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatePatch {
    pub data_groups: Option<Vec<DataGroup>>,
    pub site_name: Option<String>,
    pub departments: Option<Vec<String>>,
    pub devices: Option<Vec<DeviceState>>,
    #[serde(alias = "isValve")]
    pub valves: Option<Vec<ValveState>>,
    #[serde(alias = "deviceFrequency")]
    pub frequencies: Option<Vec<FrequencyDrive>>,
    #[serde(alias = "inData")]
    pub indata: Option<Vec<SensorReading>>,
    #[serde(alias = "outData")]
    pub outdata: Option<Vec<SensorReading>>,
    pub energy: Option<Vec<Record>>,
    pub runtime: Option<Vec<Record>>,
    pub process: Option<Vec<ProcessParameter>>,
    pub alarm: Option<Vec<Record>>,
    pub laboratory: Option<Vec<Record>>,
    pub health: Option<Vec<Record>>,
    pub production: Option<Vec<Record>>,
}

impl StatePatch {
    pub fn is_full_snapshot(&self) -> bool {
        self.data_groups.is_some()
    }

    pub fn has_items(&self) -> bool {
        self.data_groups.is_some()
            || self.devices.is_some()
            || self.valves.is_some()
            || self.frequencies.is_some()
            || self.indata.is_some()
            || self.outdata.is_some()
            || self.energy.is_some()
            || self.runtime.is_some()
            || self.process.is_some()
            || self.alarm.is_some()
            || self.laboratory.is_some()
            || self.health.is_some()
            || self.production.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFeedback {
    pub correlation_id: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub valve_name: Option<String>,
    pub parameter_name: Option<String>,
    pub alarm_name: Option<String>,
    #[serde(default)]
    pub success: bool,
    pub message: Option<String>,
}

impl CommandFeedback {
    /// Equipment the acknowledgement refers to.
    pub fn target(&self) -> Option<&str> {
        self.device_id
            .as_deref()
            .or(self.device_name.as_deref())
            .or(self.valve_name.as_deref())
            .or(self.parameter_name.as_deref())
            .or(self.alarm_name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    #[serde(default)]
    pub event_type: String,
    pub alarm_details: Option<Value>,
    #[serde(flatten)]
    pub patch: StatePatch,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Pong,
    DeviceStatus(StatePatch),
    DeviceStatusChange(StatePatch),
    CommandFeedback(CommandFeedback),
    DeviceEvent(DeviceEvent),
    #[serde(other)]
    Unknown,
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub platform: String,
    pub version: String,
    pub timestamp: i64,
}

impl ClientInfo {
    pub fn current(timestamp: i64) -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Outbound {
    Init {
        site_id: String,
        client_info: ClientInfo,
    },
    GetDeviceStatus {
        site_id: String,
        timestamp: i64,
    },
    Ping {
        site_id: String,
        timestamp: i64,
        client_id: String,
    },
    ClientClose {
        site_id: String,
        reason: String,
    },
}

impl Outbound {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Socket envelope for a command: the command's own `type` moves to `commandType`.
pub fn command_frame(
    site_id: &str,
    correlation_id: &str,
    command: &ControlCommand,
    timestamp: i64,
) -> Result<String, serde_json::Error> {
    let mut body = match serde_json::to_value(command)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let kind = body
        .remove("type")
        .unwrap_or_else(|| Value::String(command.kind().to_string()));

    body.insert("type".to_string(), Value::String("command".to_string()));
    body.insert("commandType".to_string(), kind);
    body.insert("siteId".to_string(), Value::String(site_id.to_string()));
    body.insert("timestamp".to_string(), Value::from(timestamp));
    body.insert(
        "correlationId".to_string(),
        Value::String(correlation_id.to_string()),
    );

    serde_json::to_string(&Value::Object(body))
}
