// In-memory fakes for the transport, gateway and permission ports
use crate::application::operation_journal::OperationRecord;
use crate::application::permission::PermissionGate;
use crate::application::site_gateway::SiteGateway;
use crate::application::transport::{Connector, Frame, Link, LinkEvent, TransportError};
use crate::domain::command::ControlCommand;
use crate::domain::connection::CloseInfo;
use crate::domain::protocol::StatePatch;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Server side of one fake connection.
pub struct FakeRemote {
    frames: Mutex<mpsc::UnboundedReceiver<Frame>>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl FakeRemote {
    /// The client still reads from this connection.
    pub fn is_live(&self) -> bool {
        !self.events.is_closed()
    }

    /// Stop accepting frames; further client writes fail.
    pub fn sever(&self) {
        self.frames.lock().unwrap().close();
    }

    pub fn push(&self, message: Value) {
        let _ = self.events.send(LinkEvent::Message(message.to_string()));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.events.send(LinkEvent::Message(text.to_string()));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.events.send(LinkEvent::Closed(CloseInfo::new(code, reason)));
    }

    /// Every frame the client wrote since the last call.
    pub fn take_frames(&self) -> Vec<Frame> {
        let mut frames = self.frames.lock().unwrap();
        let mut out = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            out.push(frame);
        }
        out
    }

    /// Text frames of the given message type since the last call.
    pub fn take_messages(&self, kind: &str) -> Vec<Value> {
        self.take_frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => serde_json::from_str::<Value>(&text).ok(),
                Frame::Close(_) => None,
            })
            .filter(|value| value["type"] == kind)
            .collect()
    }
}

#[derive(Default)]
pub struct FakeConnector {
    remotes: Mutex<Vec<Arc<FakeRemote>>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
}

impl FakeConnector {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn remotes(&self) -> Vec<Arc<FakeRemote>> {
        self.remotes.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Arc<FakeRemote> {
        self.remotes().last().cloned().expect("no connection was opened")
    }

    pub fn live_count(&self) -> usize {
        self.remotes().iter().filter(|r| r.is_live()).count()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, site_id: &str) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                url: format!("fake://{}", site_id),
                reason: "connection refused".to_string(),
            });
        }

        let (outbound, frames) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        self.remotes.lock().unwrap().push(Arc::new(FakeRemote {
            frames: Mutex::new(frames),
            events,
        }));

        Ok(Link { outbound, inbound })
    }
}

#[derive(Default)]
pub struct RecordingGateway {
    commands: Mutex<Vec<(String, ControlCommand)>>,
    journal: Mutex<Vec<OperationRecord>>,
    full_state: Mutex<Option<Value>>,
    fetches: AtomicUsize,
    fail_commands: AtomicBool,
    fail_journal: AtomicBool,
}

impl RecordingGateway {
    pub fn set_full_state(&self, state: Value) {
        *self.full_state.lock().unwrap() = Some(state);
    }

    pub fn fail_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::SeqCst);
    }

    pub fn fail_journal(&self, fail: bool) {
        self.fail_journal.store(fail, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<(String, ControlCommand)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn journal(&self) -> Vec<OperationRecord> {
        self.journal.lock().unwrap().clone()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SiteGateway for RecordingGateway {
    async fn fetch_full_state(&self, _site_id: &str) -> anyhow::Result<StatePatch> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.full_state.lock().unwrap().clone() {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(StatePatch::default()),
        }
    }

    async fn send_command(&self, site_id: &str, command: &ControlCommand) -> anyhow::Result<Value> {
        if self.fail_commands.load(Ordering::SeqCst) {
            anyhow::bail!("gateway returned 503");
        }
        self.commands
            .lock()
            .unwrap()
            .push((site_id.to_string(), command.clone()));
        Ok(serde_json::json!({"success": true}))
    }

    async fn record_operation(&self, record: &OperationRecord) -> anyhow::Result<()> {
        if self.fail_journal.load(Ordering::SeqCst) {
            anyhow::bail!("journal unavailable");
        }
        self.journal.lock().unwrap().push(record.clone());
        Ok(())
    }
}

pub struct StaticGate {
    allowed: AtomicBool,
    departments: Mutex<Vec<String>>,
}

impl StaticGate {
    pub fn new(allowed: bool) -> Self {
        Self {
            allowed: AtomicBool::new(allowed),
            departments: Mutex::new(Vec::new()),
        }
    }

    pub fn set_allowed(&self, allowed: bool) {
        self.allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn departments(&self) -> Vec<String> {
        self.departments.lock().unwrap().clone()
    }
}

impl PermissionGate for StaticGate {
    fn has_control_permission(&self, _user_id: &str, _site_id: &str) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }

    fn update_site_departments(&self, _site_id: &str, departments: &[String]) {
        *self.departments.lock().unwrap() = departments.to_vec();
    }
}
