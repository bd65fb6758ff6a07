// Connection lifecycle model shared by a site's screens
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub reconnect_attempts: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// Why a socket went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub const NORMAL: u16 = 1000;
    pub const UNAUTHORIZED: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(Self::NORMAL, reason)
    }

    /// Locally detected loss of the transport.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(Self::ABNORMAL, reason)
    }

    /// Normal closure and authorization rejection are final.
    pub fn suppresses_reconnect(&self) -> bool {
        self.code == Self::NORMAL || self.code == Self::UNAUTHORIZED
    }

    /// The gateway in front of the device server answered with a 502.
    pub fn indicates_gateway_fault(&self) -> bool {
        self.reason.contains("502") || self.reason.to_ascii_lowercase().contains("bad gateway")
    }
}
