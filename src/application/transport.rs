// Transport port for the persistent per-site connection
use crate::domain::connection::CloseInfo;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("connection attempt timed out")]
    Timeout,
    #[error("transport is closed")]
    Closed,
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Frames written to the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Close(CloseInfo),
}

/// Events read from the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Message(String),
    Closed(CloseInfo),
}

/// An established connection. Dropping every `outbound` sender closes the socket.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, site_id: &str) -> Result<Link, TransportError>;
}

/// Queue a text frame; fails synchronously once the writer side is gone.
pub fn send_text(outbound: &mpsc::UnboundedSender<Frame>, text: String) -> Result<(), TransportError> {
    outbound
        .send(Frame::Text(text))
        .map_err(|_| TransportError::Closed)
}

/// Encode a message and queue it as a text frame.
pub fn send_json<T: Serialize>(
    outbound: &mpsc::UnboundedSender<Frame>,
    message: &T,
) -> Result<(), TransportError> {
    let text = serde_json::to_string(message)?;
    send_text(outbound, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_send_json_reports_encode_failure() {
        let (outbound, mut frames) = mpsc::unbounded_channel();
        // JSON object keys must be strings
        let unencodable: HashMap<(u8, u8), u8> = HashMap::from([((1, 2), 3)]);

        let result = send_json(&outbound, &unencodable);

        assert!(matches!(result, Err(TransportError::Encode(_))));
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn test_send_json_after_close() {
        let (outbound, frames) = mpsc::unbounded_channel::<Frame>();
        drop(frames);

        let result = send_json(&outbound, &serde_json::json!({"type": "ping"}));

        assert!(matches!(result, Err(TransportError::Closed)));
    }
}
