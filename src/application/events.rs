// Session events fanned out to every screen watching a site
use crate::domain::command::PendingCommand;
use crate::domain::connection::ConnectionState;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    Connection(ConnectionState),
    StateUpdated {
        /// True when a snapshot replaced the whole model.
        full: bool,
    },
    Command(PendingCommand),
    CommandCleared {
        target: String,
    },
    DeviceEvent {
        event_type: String,
        details: Option<Value>,
    },
    Permission {
        allowed: bool,
    },
    ReconnectExhausted {
        attempts: u32,
    },
}

impl SessionEvent {
    /// Name used for the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connection(_) => "connection",
            SessionEvent::StateUpdated { .. } => "state_updated",
            SessionEvent::Command(_) => "command",
            SessionEvent::CommandCleared { .. } => "command_cleared",
            SessionEvent::DeviceEvent { .. } => "device_event",
            SessionEvent::Permission { .. } => "permission",
            SessionEvent::ReconnectExhausted { .. } => "reconnect_exhausted",
        }
    }
}
