// Request/response gateway port (HTTP API of the device server)
use crate::application::operation_journal::OperationRecord;
use crate::domain::command::ControlCommand;
use crate::domain::protocol::StatePatch;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait SiteGateway: Send + Sync {
    /// Full site state; used when the socket is unavailable.
    async fn fetch_full_state(&self, site_id: &str) -> anyhow::Result<StatePatch>;

    async fn send_command(&self, site_id: &str, command: &ControlCommand) -> anyhow::Result<Value>;

    async fn record_operation(&self, record: &OperationRecord) -> anyhow::Result<()>;
}
