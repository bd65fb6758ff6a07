// WebSocket connector for the device gateway
use crate::application::transport::{Connector, Frame, Link, LinkEvent, TransportError};
use crate::domain::connection::CloseInfo;
use crate::infrastructure::config::{expand_url, GatewayConfig};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

const CLIENT_TAG: &str = "sitelink";

pub struct WsConnector {
    url_template: String,
}

impl WsConnector {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            url_template: config.ws_url.clone(),
        }
    }

    /// Socket URL for a site, with cache-busting query parameters.
    pub fn site_url(&self, site_id: &str, now_millis: i64) -> String {
        let mut vars = HashMap::new();
        vars.insert("site_id".to_string(), urlencoding::encode(site_id).into_owned());
        let base = expand_url(&self.url_template, &vars);
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{}{}t={}&client={}", base, separator, now_millis, CLIENT_TAG)
    }
}

fn close_info(frame: Option<CloseFrame<'_>>) -> CloseInfo {
    match frame {
        Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.into_owned()),
        None => CloseInfo::new(CloseInfo::NO_STATUS, ""),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, site_id: &str) -> Result<Link, TransportError> {
        let url = self.site_url(site_id, chrono::Utc::now().timestamp_millis());
        tracing::debug!("Connecting to {}", url);

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let (mut write, mut read) = stream.split();

        let (outbound, mut frames) = mpsc::unbounded_channel::<Frame>();
        let (events, inbound) = mpsc::unbounded_channel::<LinkEvent>();

        // Writer: drains queued frames until a close frame or every sender is gone
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                match frame {
                    Frame::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::warn!("WebSocket send failed: {}", e);
                            break;
                        }
                    }
                    Frame::Close(close) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(close.code),
                            reason: Cow::Owned(close.reason),
                        };
                        if let Err(e) = write.send(Message::Close(Some(frame))).await {
                            tracing::debug!("WebSocket close failed: {}", e);
                        }
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        // Reader: forwards text frames and reports how the socket ended
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => LinkEvent::Message(text),
                    Ok(Message::Close(frame)) => LinkEvent::Closed(close_info(frame)),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => LinkEvent::Message(text),
                        Err(_) => {
                            tracing::debug!("Ignoring non UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(_) => continue,
                    Err(e) => LinkEvent::Closed(CloseInfo::abnormal(e.to_string())),
                };

                let closed = matches!(event, LinkEvent::Closed(_));
                if events.send(event).is_err() || closed {
                    return;
                }
            }
            let _ = events.send(LinkEvent::Closed(CloseInfo::abnormal("stream ended")));
        });

        tracing::info!("WebSocket connected for site {}", site_id);
        Ok(Link { outbound, inbound })
    }
}
