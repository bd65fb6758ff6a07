// Heartbeat scheduler - periodic liveness probes on an open connection
use crate::application::transport::{send_text, Frame, TransportError};
use crate::domain::protocol::Outbound;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Sends a `ping` every interval. Missing pongs are not treated as failure;
/// only a failed send is, and it is reported through `on_fault`.
#[derive(Debug, Clone)]
pub struct HeartbeatScheduler {
    site_id: String,
    client_id: String,
    interval: Duration,
}

impl HeartbeatScheduler {
    pub fn new(site_id: impl Into<String>, interval: Duration) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self {
            site_id: site_id.into(),
            client_id: format!("sitelink_{}_{}", std::env::consts::OS, &nonce[..8]),
            interval,
        }
    }

    pub fn start<F>(&self, outbound: mpsc::UnboundedSender<Frame>, on_fault: F) -> JoinHandle<()>
    where
        F: FnOnce(TransportError) + Send + 'static,
    {
        let site_id = self.site_id.clone();
        let client_id = self.client_id.clone();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            loop {
                ticker.tick().await;

                let ping = Outbound::Ping {
                    site_id: site_id.clone(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                    client_id: client_id.clone(),
                };
                let text = match ping.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to encode heartbeat: {}", e);
                        continue;
                    }
                };

                if let Err(e) = send_text(&outbound, text) {
                    tracing::warn!("Heartbeat for site {} failed: {}", site_id, e);
                    on_fault(e);
                    return;
                }
                tracing::trace!("Heartbeat sent for site {}", site_id);
            }
        })
    }
}
