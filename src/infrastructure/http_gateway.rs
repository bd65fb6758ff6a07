// HTTP gateway - request/response fallback against the device server API
use crate::application::operation_journal::OperationRecord;
use crate::application::site_gateway::SiteGateway;
use crate::domain::command::ControlCommand;
use crate::domain::protocol::StatePatch;
use crate::infrastructure::config::GatewayConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("gateway rejected the command: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.http_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn site_url(&self, site_id: &str) -> String {
        format!("{}/sites/site/{}", self.base_url, urlencoding::encode(site_id))
    }

    fn command_url(&self, site_id: &str) -> String {
        format!("{}/site/{}/command", self.base_url, urlencoding::encode(site_id))
    }

    fn logs_url(&self) -> String {
        format!("{}/logs", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Status { status, body }.into())
    }
}

/// Some deployments wrap the site state in `{"data": {...}}`.
fn unwrap_state(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.get("data").is_some_and(Value::is_object) => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[async_trait]
impl SiteGateway for HttpGateway {
    async fn fetch_full_state(&self, site_id: &str) -> Result<StatePatch> {
        let url = self.site_url(site_id);
        tracing::debug!("Fetching site state from {}", url);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to send site state request")?;

        let body = Self::check(response)
            .await?
            .json::<Value>()
            .await
            .context("Failed to read site state response")?;

        serde_json::from_value(unwrap_state(body)).context("Failed to parse site state")
    }

    async fn send_command(&self, site_id: &str, command: &ControlCommand) -> Result<Value> {
        let url = self.command_url(site_id);
        tracing::info!("Sending {} for {} over HTTP", command.kind(), command.target());

        let response = self
            .client
            .post(&url)
            .json(command)
            .send()
            .await
            .context("Failed to send command request")?;

        let body = Self::check(response)
            .await?
            .json::<Value>()
            .await
            .unwrap_or(Value::Null);

        if body.get("success").and_then(Value::as_bool) == Some(false) {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("command failed")
                .to_string();
            return Err(GatewayError::Rejected(message).into());
        }

        Ok(body)
    }

    async fn record_operation(&self, record: &OperationRecord) -> Result<()> {
        let response = self
            .client
            .post(self.logs_url())
            .header("Accept", "application/json")
            .json(record)
            .send()
            .await
            .context("Failed to send operation record")?;

        Self::check(response).await?;
        Ok(())
    }
}
