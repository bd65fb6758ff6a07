// Operation journal - audit trail of control actions sent to the gateway
use crate::application::site_gateway::SiteGateway;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub const BACKLOG_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationRecord {
    pub user_id: String,
    pub username: String,
    pub site_id: String,
    pub site_name: String,
    pub device_name: String,
    pub operation_type: String,
    pub operation_content: String,
    pub operation_time: DateTime<Utc>,
    pub client_info: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

/// Submits records through the gateway. Records that fail are kept in a
/// bounded backlog and retried ahead of the next submission.
pub struct OperationJournal {
    gateway: Arc<dyn SiteGateway>,
    backlog: Mutex<VecDeque<OperationRecord>>,
}

impl OperationJournal {
    pub fn new(gateway: Arc<dyn SiteGateway>) -> Self {
        Self {
            gateway,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    fn backlog(&self) -> MutexGuard<'_, VecDeque<OperationRecord>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog().len()
    }

    pub fn client_info() -> String {
        format!(
            "sitelink {} - {} {}",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        )
    }

    /// Never fails; journal problems must not affect control.
    pub async fn record(&self, record: OperationRecord) {
        let queued: Vec<OperationRecord> = self.backlog().drain(..).collect();
        if !queued.is_empty() {
            tracing::info!("Retrying {} queued operation records", queued.len());
        }

        let mut failed = Vec::new();
        for entry in queued.into_iter().chain(std::iter::once(record)) {
            if let Err(e) = self.gateway.record_operation(&entry).await {
                tracing::warn!(
                    "Failed to record operation on {} for site {}: {:#}",
                    entry.device_name,
                    entry.site_id,
                    e
                );
                failed.push(OperationRecord {
                    failed_at: entry.failed_at.or_else(|| Some(Utc::now())),
                    ..entry
                });
            }
        }

        if failed.is_empty() {
            return;
        }

        let mut backlog = self.backlog();
        backlog.extend(failed);
        while backlog.len() > BACKLOG_LIMIT {
            backlog.pop_front();
        }
    }
}
