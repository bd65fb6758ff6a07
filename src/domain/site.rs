// Site state model - typed groups of monitored and controlled items
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Section type of a data group. Decides which item shape and merge rule apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Sensor,
    Device,
    Valve,
    Frequency,
    Energy,
    Runtime,
    Process,
    Alarm,
    Laboratory,
    Health,
    Production,
    #[default]
    #[serde(other)]
    Other,
}

/// Items are identified by name within their group and are only ever overlaid.
pub trait Keyed {
    fn key(&self) -> &str;

    /// Shallow merge: fields present in `patch` replace ours, absent ones are kept.
    fn overlay(&mut self, patch: Self);
}

fn overlay_field<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn overlay_extra(extra: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        extra.insert(key, value);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub name: String,
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub data: Option<f64>,
    #[serde(default, alias = "dw", skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(
        default,
        alias = "alarmFlag",
        deserialize_with = "lenient::flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub alarm: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Keyed for SensorReading {
    fn key(&self) -> &str {
        &self.name
    }

    fn overlay(&mut self, patch: Self) {
        overlay_field(&mut self.data, patch.data);
        overlay_field(&mut self.unit, patch.unit);
        overlay_field(&mut self.alarm, patch.alarm);
        overlay_extra(&mut self.extra, patch.extra);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub name: String,
    #[serde(default, deserialize_with = "lenient::flag", skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, deserialize_with = "lenient::flag", skip_serializing_if = "Option::is_none")]
    pub fault: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Keyed for DeviceState {
    fn key(&self) -> &str {
        &self.name
    }

    fn overlay(&mut self, patch: Self) {
        overlay_field(&mut self.running, patch.running);
        overlay_field(&mut self.fault, patch.fault);
        overlay_extra(&mut self.extra, patch.extra);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValveState {
    pub name: String,
    #[serde(default, deserialize_with = "lenient::flag", skip_serializing_if = "Option::is_none")]
    pub open: Option<bool>,
    #[serde(default, deserialize_with = "lenient::flag", skip_serializing_if = "Option::is_none")]
    pub closed: Option<bool>,
    #[serde(default, deserialize_with = "lenient::flag", skip_serializing_if = "Option::is_none")]
    pub fault: Option<bool>,
    #[serde(default, alias = "openKey", skip_serializing_if = "Option::is_none")]
    pub open_command_key: Option<String>,
    #[serde(default, alias = "closeKey", skip_serializing_if = "Option::is_none")]
    pub close_command_key: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Keyed for ValveState {
    fn key(&self) -> &str {
        &self.name
    }

    fn overlay(&mut self, patch: Self) {
        overlay_field(&mut self.open, patch.open);
        overlay_field(&mut self.closed, patch.closed);
        overlay_field(&mut self.fault, patch.fault);
        overlay_field(&mut self.open_command_key, patch.open_command_key);
        overlay_field(&mut self.close_command_key, patch.close_command_key);
        overlay_extra(&mut self.extra, patch.extra);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrequencyDrive {
    pub name: String,
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub measured_hz: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub setpoint_hz: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Keyed for FrequencyDrive {
    fn key(&self) -> &str {
        &self.name
    }

    fn overlay(&mut self, patch: Self) {
        overlay_field(&mut self.measured_hz, patch.measured_hz);
        overlay_field(&mut self.setpoint_hz, patch.setpoint_hz);
        overlay_extra(&mut self.extra, patch.extra);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessParameter {
    pub name: String,
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub lower_limit: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub upper_limit: Option<f64>,
    #[serde(default, deserialize_with = "lenient::number", skip_serializing_if = "Option::is_none")]
    pub coefficient: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Keyed for ProcessParameter {
    fn key(&self) -> &str {
        &self.name
    }

    fn overlay(&mut self, patch: Self) {
        overlay_field(&mut self.value, patch.value);
        overlay_field(&mut self.lower_limit, patch.lower_limit);
        overlay_field(&mut self.upper_limit, patch.upper_limit);
        overlay_field(&mut self.coefficient, patch.coefficient);
        overlay_field(&mut self.status, patch.status);
        overlay_extra(&mut self.extra, patch.extra);
    }
}

/// Free-form item used by the energy, runtime, alarm, laboratory, health and
/// production sections (and anything of unknown type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Record {
    pub name: String,
    pub fields: Map<String, Value>,
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        let name = fields
            .get("name")
            .or_else(|| fields.get("id"))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        Self { name, fields }
    }
}

impl From<Record> for Map<String, Value> {
    fn from(record: Record) -> Self {
        record.fields
    }
}

impl Keyed for Record {
    fn key(&self) -> &str {
        &self.name
    }

    fn overlay(&mut self, patch: Self) {
        overlay_extra(&mut self.fields, patch.fields);
    }
}

/// Items of a group, shaped by the group's kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GroupItems {
    Sensors(Vec<SensorReading>),
    Devices(Vec<DeviceState>),
    Valves(Vec<ValveState>),
    Frequencies(Vec<FrequencyDrive>),
    Processes(Vec<ProcessParameter>),
    Records(Vec<Record>),
}

impl GroupItems {
    pub fn empty(kind: GroupKind) -> Self {
        match kind {
            GroupKind::Sensor => GroupItems::Sensors(Vec::new()),
            GroupKind::Device => GroupItems::Devices(Vec::new()),
            GroupKind::Valve => GroupItems::Valves(Vec::new()),
            GroupKind::Frequency => GroupItems::Frequencies(Vec::new()),
            GroupKind::Process => GroupItems::Processes(Vec::new()),
            _ => GroupItems::Records(Vec::new()),
        }
    }

    pub fn decode(kind: GroupKind, data: Vec<Value>) -> Result<Self, serde_json::Error> {
        let raw = Value::Array(data);
        Ok(match kind {
            GroupKind::Sensor => GroupItems::Sensors(serde_json::from_value(raw)?),
            GroupKind::Device => GroupItems::Devices(serde_json::from_value(raw)?),
            GroupKind::Valve => GroupItems::Valves(serde_json::from_value(raw)?),
            GroupKind::Frequency => GroupItems::Frequencies(serde_json::from_value(raw)?),
            GroupKind::Process => GroupItems::Processes(serde_json::from_value(raw)?),
            _ => GroupItems::Records(serde_json::from_value(raw)?),
        })
    }

    pub fn len(&self) -> usize {
        match self {
            GroupItems::Sensors(items) => items.len(),
            GroupItems::Devices(items) => items.len(),
            GroupItems::Valves(items) => items.len(),
            GroupItems::Frequencies(items) => items.len(),
            GroupItems::Processes(items) => items.len(),
            GroupItems::Records(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGroup")]
pub struct DataGroup {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: GroupKind,
    #[serde(rename = "data")]
    pub items: GroupItems,
}

impl DataGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: GroupKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            items: GroupItems::empty(kind),
        }
    }
}

#[derive(Deserialize)]
struct RawGroup {
    #[serde(default, deserialize_with = "lenient::identifier")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default)]
    kind: GroupKind,
    #[serde(default)]
    data: Vec<Value>,
}

impl TryFrom<RawGroup> for DataGroup {
    type Error = serde_json::Error;

    fn try_from(raw: RawGroup) -> Result<Self, Self::Error> {
        let items = GroupItems::decode(raw.kind, raw.data)?;
        let name = raw.name.unwrap_or_else(|| raw.id.clone());
        Ok(Self {
            id: raw.id,
            name,
            kind: raw.kind,
            items,
        })
    }
}

/// In-memory model of one site.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteState {
    pub site_id: String,
    pub name: Option<String>,
    pub groups: Vec<DataGroup>,
    pub departments: Vec<String>,
}

impl SiteState {
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            ..Self::default()
        }
    }

    pub fn group(&self, id: &str) -> Option<&DataGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceState> {
        self.groups.iter().find_map(|g| match &g.items {
            GroupItems::Devices(items) => items.iter().find(|d| d.name == name),
            _ => None,
        })
    }

    pub fn valve(&self, name: &str) -> Option<&ValveState> {
        self.groups.iter().find_map(|g| match &g.items {
            GroupItems::Valves(items) => items.iter().find(|v| v.name == name),
            _ => None,
        })
    }

    pub fn sensor(&self, group_id: &str, name: &str) -> Option<&SensorReading> {
        match &self.group(group_id)?.items {
            GroupItems::Sensors(items) => items.iter().find(|s| s.name == name),
            _ => None,
        }
    }
}

/// Gateways report flags as 0/1, booleans or strings, and numbers sometimes as strings.
mod lenient {
    use super::*;

    pub fn flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Bool(b)) => Some(b),
            Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0),
            Some(Value::String(s)) => match s.trim() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        })
    }

    pub fn number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<Value>::deserialize(deserializer)? {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn identifier<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }
}
