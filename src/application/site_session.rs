// Site session - owns the single live connection of one site
use crate::application::command_dispatcher::CommandDispatcher;
use crate::application::events::SessionEvent;
use crate::application::heartbeat::HeartbeatScheduler;
use crate::application::operation_journal::{OperationJournal, OperationRecord};
use crate::application::permission::PermissionGate;
use crate::application::reconnect_policy::ReconnectionPolicy;
use crate::application::site_gateway::SiteGateway;
use crate::application::state_merger;
use crate::application::transport::{send_json, Connector, Frame, Link, LinkEvent, TransportError};
use crate::domain::command::{ControlCommand, InvalidCommand, PendingCommand};
use crate::domain::connection::{CloseInfo, ConnectionPhase, ConnectionState};
use crate::domain::protocol::{ClientInfo, Inbound, Outbound, StatePatch};
use crate::domain::site::SiteState;
use crate::infrastructure::config::{ClientConfig, OperatorConfig};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

pub type ScreenId = u64;

/// Collaborators shared by every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn Connector>,
    pub gateway: Arc<dyn SiteGateway>,
    pub permissions: Arc<dyn PermissionGate>,
    pub journal: Arc<OperationJournal>,
    pub operator: OperatorConfig,
    pub config: ClientConfig,
}

/// How a control command left the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRoute {
    /// Sent on the socket; the outcome arrives as a pending-command update.
    Socket { correlation_id: String },
    /// Sent over HTTP and followed by a full state fetch.
    Http,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("permission denied")]
    PermissionDenied,
    #[error(transparent)]
    Invalid(#[from] InvalidCommand),
    #[error("command could not be delivered: {0:#}")]
    Fallback(anyhow::Error),
}

struct ActiveLink {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    heartbeat: JoinHandle<()>,
}

impl ActiveLink {
    fn detach(self, close: Option<CloseInfo>) {
        self.heartbeat.abort();
        if let Some(close) = close {
            let _ = self.outbound.send(Frame::Close(close));
        }
    }
}

struct Inner {
    phase: ConnectionPhase,
    policy: ReconnectionPolicy,
    last_heartbeat_at: Option<DateTime<Utc>>,
    /// Bumped on every connect; callbacks carrying an older epoch are ignored.
    epoch: u64,
    link: Option<ActiveLink>,
    task: Option<JoinHandle<()>>,
    screens: HashMap<ScreenId, bool>,
    next_screen: ScreenId,
    foreground: bool,
    reconnect_timer: Option<JoinHandle<()>>,
    snapshot_fallback: Option<JoinHandle<()>>,
    poller: Option<JoinHandle<()>>,
    control_permitted: bool,
    shut_down: bool,
}

impl Inner {
    fn has_focus(&self) -> bool {
        self.screens.values().any(|focused| *focused)
    }

    fn may_connect(&self) -> bool {
        !self.shut_down && self.foreground && self.has_focus()
    }

    fn connection(&self) -> ConnectionState {
        ConnectionState {
            phase: self.phase,
            reconnect_attempts: self.policy.attempts(),
            last_heartbeat_at: self.last_heartbeat_at,
        }
    }

    fn current_outbound(&self) -> Option<(u64, mpsc::UnboundedSender<Frame>)> {
        if self.phase != ConnectionPhase::Open {
            return None;
        }
        self.link
            .as_ref()
            .filter(|link| link.epoch == self.epoch)
            .map(|link| (link.epoch, link.outbound.clone()))
    }

    fn cancel_reconnect(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        self.policy.cancel();
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }

    fn cancel_snapshot_fallback(&mut self) {
        if let Some(fallback) = self.snapshot_fallback.take() {
            fallback.abort();
        }
    }

    /// Drop the current transport. The read task is aborted so a superseded
    /// connection can no longer report its close.
    fn teardown(&mut self, close: Option<CloseInfo>) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            link.detach(close);
        }
        self.cancel_snapshot_fallback();
    }
}

/// One per site, shared by every screen showing that site.
pub struct SiteSession {
    site_id: String,
    deps: SessionDeps,
    state: RwLock<SiteState>,
    inner: Mutex<Inner>,
    dispatcher: CommandDispatcher,
    heartbeat: HeartbeatScheduler,
    events: broadcast::Sender<SessionEvent>,
    this: Weak<SiteSession>,
}

impl SiteSession {
    pub fn new(site_id: impl Into<String>, deps: SessionDeps, foreground: bool) -> Arc<Self> {
        let site_id = site_id.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let control_permitted = deps
            .permissions
            .has_control_permission(&deps.operator.user_id, &site_id);

        Arc::new_cyclic(|this| Self {
            dispatcher: CommandDispatcher::new(
                site_id.clone(),
                deps.config.commands.clone(),
                events.clone(),
            ),
            heartbeat: HeartbeatScheduler::new(
                site_id.clone(),
                deps.config.session.heartbeat_interval(),
            ),
            state: RwLock::new(SiteState::new(site_id.clone())),
            inner: Mutex::new(Inner {
                phase: ConnectionPhase::Idle,
                policy: ReconnectionPolicy::new(deps.config.reconnect.clone()),
                last_heartbeat_at: None,
                epoch: 0,
                link: None,
                task: None,
                screens: HashMap::new(),
                next_screen: 0,
                foreground,
                reconnect_timer: None,
                snapshot_fallback: None,
                poller: None,
                control_permitted,
                shut_down: false,
            }),
            events,
            site_id,
            deps,
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SiteState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn connection(&self) -> ConnectionState {
        self.lock().connection()
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.dispatcher.pending_all()
    }

    pub fn pending_command(&self, target: &str) -> Option<PendingCommand> {
        self.dispatcher.pending(target)
    }

    pub fn control_permitted(&self) -> bool {
        self.lock().control_permitted
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    pub fn screen_count(&self) -> usize {
        self.lock().screens.len()
    }

    // ---- screen lifecycle ----

    pub fn attach_screen(&self) -> ScreenId {
        let mut inner = self.lock();
        inner.next_screen += 1;
        let id = inner.next_screen;
        inner.screens.insert(id, false);
        tracing::debug!("Screen {} attached to site {}", id, self.site_id);
        id
    }

    /// Returns the number of screens still attached.
    pub fn detach_screen(&self, screen: ScreenId) -> usize {
        self.blur(screen);
        let mut inner = self.lock();
        inner.screens.remove(&screen);
        tracing::debug!("Screen {} detached from site {}", screen, self.site_id);
        inner.screens.len()
    }

    pub fn focus(&self, screen: ScreenId) {
        {
            let mut inner = self.lock();
            if inner.shut_down {
                return;
            }
            match inner.screens.get_mut(&screen) {
                Some(focused) => *focused = true,
                None => return,
            }
            inner.policy.rearm();
            if inner.foreground {
                self.start_poller(&mut inner);
            }
        }

        self.refresh_permission();
        self.connect();
    }

    /// Losing focus never closes the socket; it only stops automatic work.
    pub fn blur(&self, screen: ScreenId) {
        let mut inner = self.lock();
        if let Some(focused) = inner.screens.get_mut(&screen) {
            *focused = false;
        }
        if !inner.has_focus() {
            inner.cancel_reconnect();
            inner.stop_poller();
        }
    }

    pub fn set_foreground(&self, foreground: bool) {
        {
            let mut inner = self.lock();
            if inner.foreground == foreground {
                return;
            }
            inner.foreground = foreground;

            if !foreground {
                tracing::debug!("Site {} moved to background", self.site_id);
                inner.cancel_reconnect();
                inner.stop_poller();
                return;
            }
            if !inner.has_focus() || inner.shut_down {
                return;
            }
            inner.policy.rearm();
            self.start_poller(&mut inner);
        }

        self.connect();
    }

    // ---- connection lifecycle ----

    /// Open the site's connection unless one is already connecting or open.
    pub fn connect(&self) {
        let state = {
            let mut inner = self.lock();
            if !inner.may_connect() {
                tracing::debug!(
                    "Not connecting site {} without a focused foreground screen",
                    self.site_id
                );
                return;
            }
            if matches!(inner.phase, ConnectionPhase::Connecting | ConnectionPhase::Open) {
                return;
            }
            if inner.policy.is_stopped() {
                tracing::debug!("Reconnection for site {} is stopped", self.site_id);
                return;
            }

            inner.teardown(None);
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.abort();
            }
            inner.epoch += 1;
            inner.phase = ConnectionPhase::Connecting;

            let epoch = inner.epoch;
            tracing::info!("Connecting site {} (epoch {})", self.site_id, epoch);
            inner.task = Some(tokio::spawn(Self::run_connection(self.this.clone(), epoch)));
            inner.connection()
        };

        self.publish(SessionEvent::Connection(state));
    }

    async fn run_connection(this: Weak<Self>, epoch: u64) {
        let Some(session) = this.upgrade() else {
            return;
        };
        let connector = session.deps.connector.clone();
        let site_id = session.site_id.clone();
        let timeout = session.deps.config.gateway.connect_timeout();
        drop(session);

        let opened = tokio::time::timeout(timeout, connector.open(&site_id)).await;

        let Some(session) = this.upgrade() else {
            return;
        };
        let link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                tracing::warn!("Site {} connection failed: {}", site_id, e);
                session.on_closed(epoch, CloseInfo::abnormal(e.to_string()));
                return;
            }
            Err(_) => {
                tracing::warn!("Site {} connection timed out", site_id);
                session.on_closed(epoch, CloseInfo::abnormal(TransportError::Timeout.to_string()));
                return;
            }
        };

        let Link {
            outbound,
            mut inbound,
        } = link;
        if !session.on_open(epoch, outbound) {
            return;
        }
        drop(session);

        while let Some(event) = inbound.recv().await {
            let Some(session) = this.upgrade() else {
                return;
            };
            match event {
                LinkEvent::Message(text) => session.handle_message(&text),
                LinkEvent::Closed(close) => {
                    session.on_closed(epoch, close);
                    return;
                }
            }
        }

        if let Some(session) = this.upgrade() {
            session.on_closed(epoch, CloseInfo::abnormal("connection lost"));
        }
    }

    /// Returns false when the connection was superseded while opening.
    fn on_open(&self, epoch: u64, outbound: mpsc::UnboundedSender<Frame>) -> bool {
        let state = {
            let mut inner = self.lock();
            if inner.epoch != epoch || inner.phase != ConnectionPhase::Connecting || inner.shut_down {
                tracing::debug!("Discarding superseded connection for site {}", self.site_id);
                let _ = outbound.send(Frame::Close(CloseInfo::normal("superseded")));
                return false;
            }

            let this = self.this.clone();
            let heartbeat = self.heartbeat.start(outbound.clone(), move |e| {
                if let Some(session) = this.upgrade() {
                    session.on_transport_fault(epoch, e);
                }
            });

            inner.phase = ConnectionPhase::Open;
            inner.policy.on_open();
            inner.link = Some(ActiveLink {
                epoch,
                outbound: outbound.clone(),
                heartbeat,
            });
            inner.connection()
        };
        tracing::info!("Site {} connected", self.site_id);
        self.publish(SessionEvent::Connection(state));

        let init = Outbound::Init {
            site_id: self.site_id.clone(),
            client_info: ClientInfo::current(Utc::now().timestamp_millis()),
        };
        if let Err(e) = self.send_outbound(&outbound, &init) {
            self.on_transport_fault(epoch, e);
            return false;
        }

        // Give the server time to register the session before asking for state
        let this = self.this.clone();
        let delay = self.deps.config.session.snapshot_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = this.upgrade() else {
                return;
            };
            // The request belongs to this connection only
            if session.lock().epoch != epoch {
                return;
            }
            session.request_snapshot();
        });

        true
    }

    fn send_outbound(
        &self,
        outbound: &mpsc::UnboundedSender<Frame>,
        message: &Outbound,
    ) -> Result<(), TransportError> {
        send_json(outbound, message).inspect_err(|e| {
            if matches!(e, TransportError::Encode(_)) {
                tracing::error!("Failed to encode message for site {}: {}", self.site_id, e);
            }
        })
    }

    fn on_transport_fault(&self, epoch: u64, error: TransportError) {
        tracing::warn!("Transport fault on site {}: {}", self.site_id, error);
        self.on_closed(epoch, CloseInfo::abnormal(error.to_string()));
    }

    fn on_closed(&self, epoch: u64, close: CloseInfo) {
        let mut exhausted = None;
        let state = {
            let mut inner = self.lock();
            if inner.epoch != epoch
                || !matches!(inner.phase, ConnectionPhase::Connecting | ConnectionPhase::Open)
            {
                tracing::debug!(
                    "Ignoring close {} from stale connection of site {}",
                    close.code,
                    self.site_id
                );
                return;
            }

            inner.phase = ConnectionPhase::Closed;
            inner.teardown(None);
            tracing::info!(
                "Site {} connection closed: {} {}",
                self.site_id,
                close.code,
                close.reason
            );

            if close.suppresses_reconnect() {
                tracing::info!("Close code {} is final, not reconnecting", close.code);
            } else if !inner.may_connect() {
                tracing::info!("Site {} is not in focus, not reconnecting", self.site_id);
            } else {
                match inner.policy.on_abnormal_close(&close) {
                    Some(delay) => {
                        tracing::info!(
                            "Reconnecting site {} in {:?} (attempt {})",
                            self.site_id,
                            delay,
                            inner.policy.attempts()
                        );
                        let this = self.this.clone();
                        inner.reconnect_timer = Some(tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Some(session) = this.upgrade() {
                                session.reconnect_due(epoch);
                            }
                        }));
                    }
                    None => exhausted = Some(inner.policy.attempts()),
                }
            }
            inner.connection()
        };

        self.publish(SessionEvent::Connection(state));
        if let Some(attempts) = exhausted {
            self.publish(SessionEvent::ReconnectExhausted { attempts });
        }
    }

    fn reconnect_due(&self, epoch: u64) {
        {
            let mut inner = self.lock();
            // The timer is the running task; forget the handle without aborting it
            inner.reconnect_timer = None;
            if inner.epoch != epoch || inner.phase != ConnectionPhase::Closed {
                return;
            }
            if !inner.may_connect() {
                inner.policy.cancel();
                return;
            }
            inner.policy.on_attempt();
        }
        self.connect();
    }

    /// Notify the gateway and close the socket normally. The session is unusable afterwards.
    pub fn shutdown(&self, reason: &str) {
        let (link, state) = {
            let mut inner = self.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.cancel_reconnect();
            inner.stop_poller();
            inner.cancel_snapshot_fallback();
            if let Some(task) = inner.task.take() {
                task.abort();
            }
            inner.epoch += 1;
            inner.phase = ConnectionPhase::Closed;
            (inner.link.take(), inner.connection())
        };

        if let Some(link) = link {
            let notice = Outbound::ClientClose {
                site_id: self.site_id.clone(),
                reason: reason.to_string(),
            };
            if let Err(e) = self.send_outbound(&link.outbound, &notice) {
                tracing::debug!("Could not send close notice for site {}: {}", self.site_id, e);
            }
            link.detach(Some(CloseInfo::normal(reason)));
            tracing::info!("Site {} session closed: {}", self.site_id, reason);
        }

        self.publish(SessionEvent::Connection(state));
    }

    // ---- inbound ----

    fn handle_message(&self, text: &str) {
        let message = match Inbound::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping malformed message on site {}: {}", self.site_id, e);
                return;
            }
        };

        match message {
            Inbound::Pong => {
                self.lock().last_heartbeat_at = Some(Utc::now());
                tracing::trace!("Pong from site {}", self.site_id);
            }
            Inbound::DeviceStatus(patch) => {
                self.lock().cancel_snapshot_fallback();
                self.apply_patch(patch);
            }
            Inbound::DeviceStatusChange(patch) => {
                if patch.is_full_snapshot() {
                    self.lock().cancel_snapshot_fallback();
                }
                self.apply_patch(patch);
            }
            Inbound::CommandFeedback(feedback) => {
                self.dispatcher.acknowledge(&feedback);
            }
            Inbound::DeviceEvent(event) => {
                tracing::info!("Device event on site {}: {}", self.site_id, event.event_type);
                self.publish(SessionEvent::DeviceEvent {
                    event_type: event.event_type,
                    details: event.alarm_details,
                });
                if event.patch.has_items() {
                    self.apply_patch(event.patch);
                }
            }
            Inbound::Unknown => {
                tracing::debug!("Ignoring unknown message on site {}", self.site_id);
            }
        }
    }

    /// Every state source, socket or HTTP, lands here.
    fn apply_patch(&self, patch: StatePatch) {
        let (outcome, departments) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let outcome = state_merger::apply_patch(&mut state, patch);
            let departments = outcome
                .departments_changed
                .then(|| state.departments.clone());
            (outcome, departments)
        };

        if let Some(departments) = departments {
            self.deps
                .permissions
                .update_site_departments(&self.site_id, &departments);
            self.refresh_permission();
        }

        self.publish(SessionEvent::StateUpdated {
            full: outcome.replaced,
        });
    }

    fn refresh_permission(&self) {
        let allowed = self
            .deps
            .permissions
            .has_control_permission(&self.deps.operator.user_id, &self.site_id);
        let changed = {
            let mut inner = self.lock();
            let changed = inner.control_permitted != allowed;
            inner.control_permitted = allowed;
            changed
        };
        if changed {
            tracing::info!("Control permission on site {} is now {}", self.site_id, allowed);
            self.publish(SessionEvent::Permission { allowed });
        }
    }

    // ---- state refresh ----

    /// Ask for a snapshot on the socket, or fetch it over HTTP when there is none.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        if self.request_snapshot() {
            return Ok(());
        }
        self.fetch_over_http().await
    }

    /// Sends `get_device_status` and arms the HTTP fallback timer.
    fn request_snapshot(&self) -> bool {
        let Some((epoch, outbound)) = self.lock().current_outbound() else {
            return false;
        };

        let request = Outbound::GetDeviceStatus {
            site_id: self.site_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.send_outbound(&outbound, &request) {
            self.on_transport_fault(epoch, e);
            return false;
        }

        let this = self.this.clone();
        let wait = self.deps.config.session.status_fallback();
        let fallback = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(session) = this.upgrade() else {
                return;
            };
            tracing::info!(
                "No snapshot from site {} within {:?}, fetching over HTTP",
                session.site_id,
                wait
            );
            if let Err(e) = session.fetch_over_http().await {
                tracing::warn!("HTTP state fetch for site {} failed: {:#}", session.site_id, e);
            }
        });

        let mut inner = self.lock();
        inner.cancel_snapshot_fallback();
        inner.snapshot_fallback = Some(fallback);
        true
    }

    async fn fetch_over_http(&self) -> anyhow::Result<()> {
        let patch = self.deps.gateway.fetch_full_state(&self.site_id).await?;
        self.apply_patch(patch);
        Ok(())
    }

    fn start_poller(&self, inner: &mut Inner) {
        if inner.poller.is_some() {
            return;
        }
        let this = self.this.clone();
        let period = self.deps.config.session.poll_interval();

        inner.poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(session) = this.upgrade() else {
                    return;
                };
                if let Err(e) = session.refresh().await {
                    tracing::warn!("Polling site {} failed: {:#}", session.site_id, e);
                }
            }
        }));
    }

    // ---- control ----

    /// Validate, check permission, journal, then dispatch on the socket or
    /// fall back to HTTP.
    pub async fn send_command(&self, command: ControlCommand) -> Result<CommandRoute, ControlError> {
        command.validate()?;

        if !self
            .deps
            .permissions
            .has_control_permission(&self.deps.operator.user_id, &self.site_id)
        {
            tracing::warn!(
                "User {} may not control {} on site {}",
                self.deps.operator.user_id,
                command.target(),
                self.site_id
            );
            return Err(ControlError::PermissionDenied);
        }

        self.journal(&command);

        let outbound = self.lock().current_outbound().map(|(_, outbound)| outbound);
        match self.dispatcher.send(outbound.as_ref(), &command) {
            Ok(pending) => Ok(CommandRoute::Socket {
                correlation_id: pending.correlation_id,
            }),
            Err(e) => {
                tracing::info!(
                    "Socket dispatch for site {} unavailable ({}), using HTTP",
                    self.site_id,
                    e
                );
                self.send_over_http(&command).await
            }
        }
    }

    async fn send_over_http(&self, command: &ControlCommand) -> Result<CommandRoute, ControlError> {
        self.deps
            .gateway
            .send_command(&self.site_id, command)
            .await
            .map_err(ControlError::Fallback)?;

        // No structured acknowledgement on this path; re-read the site instead
        if let Err(e) = self.fetch_over_http().await {
            tracing::warn!(
                "State refresh after HTTP command on site {} failed: {:#}",
                self.site_id,
                e
            );
        }
        Ok(CommandRoute::Http)
    }

    fn journal(&self, command: &ControlCommand) {
        let site_name = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name
            .clone()
            .unwrap_or_else(|| self.site_id.clone());
        let record = OperationRecord {
            user_id: self.deps.operator.user_id.clone(),
            username: self.deps.operator.username.clone(),
            site_id: self.site_id.clone(),
            site_name,
            device_name: command.target().to_string(),
            operation_type: command.operation_type().to_string(),
            operation_content: command.describe(),
            operation_time: Utc::now(),
            client_info: OperationJournal::client_info(),
            failed_at: None,
        };

        let journal = self.deps.journal.clone();
        tokio::spawn(async move {
            journal.record(record).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::test_support::{settle, FakeConnector, RecordingGateway, StaticGate};
    use crate::domain::command::{CommandStatus, DeviceAction};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        session: Arc<SiteSession>,
        connector: Arc<FakeConnector>,
        gateway: Arc<RecordingGateway>,
        gate: Arc<StaticGate>,
    }

    fn harness() -> Harness {
        harness_with(ClientConfig::default())
    }

    fn harness_with(config: ClientConfig) -> Harness {
        let connector = Arc::new(FakeConnector::default());
        let gateway = Arc::new(RecordingGateway::default());
        let gate = Arc::new(StaticGate::new(true));
        let deps = SessionDeps {
            connector: connector.clone(),
            gateway: gateway.clone(),
            permissions: gate.clone(),
            journal: Arc::new(OperationJournal::new(gateway.clone())),
            operator: OperatorConfig {
                user_id: "42".to_string(),
                username: "operator".to_string(),
                ..OperatorConfig::default()
            },
            config,
        };
        Harness {
            session: SiteSession::new("7", deps, true),
            connector,
            gateway,
            gate,
        }
    }

    fn stop(device: &str) -> ControlCommand {
        ControlCommand::DeviceControl {
            device_name: device.to_string(),
            action: DeviceAction::Stop,
        }
    }

    async fn advance(duration: Duration) {
        tokio::time::advance(duration).await;
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_sends_init_then_snapshot_request() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;

        assert_eq!(h.session.connection().phase, ConnectionPhase::Open);
        let remote = h.connector.latest();
        let init = remote.take_messages("init");
        assert_eq!(init.len(), 1);
        assert_eq!(init[0]["siteId"], "7");

        advance(Duration::from_millis(1000)).await;
        assert_eq!(remote.take_messages("get_device_status").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_push_and_command_round_trip() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        let remote = h.connector.latest();

        remote.push(json!({
            "type": "device_status",
            "dataGroups": [
                {"id": "pumps", "name": "Pumps", "type": "device",
                 "data": [{"name": "P1", "running": false, "fault": false}]},
                {"id": "indata", "name": "Influent", "type": "sensor",
                 "data": [{"name": "COD", "data": 300.0, "unit": "mg/L"}]}
            ]
        }));
        remote.push(json!({"type": "device_status_change", "devices": [{"name": "P1", "running": true}]}));
        settle().await;

        let state = h.session.snapshot();
        let p1 = state.device("P1").unwrap();
        assert_eq!(p1.running, Some(true));
        assert_eq!(p1.fault, Some(false));
        assert_eq!(state.sensor("indata", "COD").unwrap().data, Some(300.0));

        remote.take_frames();
        let route = h.session.send_command(stop("P1")).await.unwrap();
        let CommandRoute::Socket { correlation_id } = route else {
            panic!("expected socket dispatch");
        };
        let sent = remote.take_messages("command");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["commandType"], "device_control");
        assert_eq!(sent[0]["deviceName"], "P1");
        assert_eq!(sent[0]["action"], "stop");
        assert_eq!(h.session.pending_command("P1").unwrap().status, CommandStatus::Pending);

        remote.push(json!({"type": "command_feedback", "deviceId": "P1", "success": true}));
        settle().await;
        let entry = h.session.pending_command("P1").unwrap();
        assert_eq!(entry.status, CommandStatus::Success);
        assert_eq!(entry.correlation_id, correlation_id);

        advance(Duration::from_secs(3)).await;
        assert!(h.session.pending_command("P1").is_none());
        assert_eq!(h.gateway.journal().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_screens_share_one_connection() {
        let h = harness();
        let first = h.session.attach_screen();
        let second = h.session.attach_screen();

        h.session.focus(first);
        h.session.focus(second);
        settle().await;
        assert_eq!(h.connector.attempts(), 1);

        h.session.blur(first);
        h.session.detach_screen(first);
        h.session.focus(second);
        let third = h.session.attach_screen();
        h.session.focus(third);
        h.session.blur(second);
        settle().await;

        assert_eq!(h.connector.attempts(), 1);
        assert_eq!(h.connector.live_count(), 1);
        assert_eq!(h.session.connection().phase, ConnectionPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfocused_session_does_not_connect() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.connect();
        settle().await;
        assert_eq!(h.connector.attempts(), 0);

        h.session.set_foreground(false);
        h.session.focus(screen);
        settle().await;
        assert_eq!(h.connector.attempts(), 0);

        h.session.set_foreground(true);
        settle().await;
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_close_codes_do_not_reconnect() {
        for code in [CloseInfo::NORMAL, CloseInfo::UNAUTHORIZED] {
            let h = harness();
            let screen = h.session.attach_screen();
            h.session.focus(screen);
            settle().await;

            h.connector.latest().close(code, "closed by server");
            settle().await;
            assert_eq!(h.session.connection().phase, ConnectionPhase::Closed);

            advance(Duration::from_secs(120)).await;
            assert_eq!(h.connector.attempts(), 1, "code {}", code);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_abnormal_close_backs_off_and_stops() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        let mut events = h.session.subscribe();

        h.connector.set_failing(true);
        h.connector.latest().close(CloseInfo::ABNORMAL, "reset");
        settle().await;
        assert_eq!(h.session.connection().reconnect_attempts, 1);

        // attempt n runs min(1000 * 1.5^(n-1), 60000) ms after the previous failure
        for n in 1..=10u32 {
            let delay = (1000.0 * 1.5f64.powi(n as i32 - 1)).min(60_000.0) as u64;
            advance(Duration::from_millis(delay - 1)).await;
            assert_eq!(h.connector.attempts(), n as usize, "before attempt {}", n);
            advance(Duration::from_millis(1)).await;
            assert_eq!(h.connector.attempts(), n as usize + 1, "after attempt {}", n);
        }

        advance(Duration::from_secs(600)).await;
        assert_eq!(h.connector.attempts(), 11);

        let mut exhausted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::ReconnectExhausted { attempts: 10 }) {
                exhausted = true;
            }
        }
        assert!(exhausted);

        // focusing again re-arms a user-initiated retry
        h.connector.set_failing(false);
        h.session.blur(screen);
        h.session.focus(screen);
        settle().await;
        assert_eq!(h.connector.attempts(), 12);
        assert_eq!(h.session.connection().phase, ConnectionPhase::Open);
        assert_eq!(h.session.connection().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gateway_fault_uses_longer_delay() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;

        h.connector.latest().close(1011, "502 Bad Gateway");
        settle().await;

        advance(Duration::from_millis(4999)).await;
        assert_eq!(h.connector.attempts(), 1);
        advance(Duration::from_millis(1)).await;
        assert_eq!(h.connector.attempts(), 2);
        assert_eq!(h.connector.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blurred_session_waits_for_focus_to_reconnect() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;

        h.session.blur(screen);
        assert_eq!(h.connector.live_count(), 1);

        h.connector.latest().close(CloseInfo::ABNORMAL, "reset");
        settle().await;
        advance(Duration::from_secs(120)).await;
        assert_eq!(h.connector.attempts(), 1);

        h.session.focus(screen);
        settle().await;
        assert_eq!(h.connector.attempts(), 2);
        assert_eq!(h.connector.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blur_cancels_scheduled_reconnect() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;

        h.connector.latest().close(CloseInfo::ABNORMAL, "reset");
        settle().await;
        h.session.blur(screen);

        advance(Duration::from_secs(120)).await;
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_close_is_ignored() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        let first = h.connector.latest();

        first.close(CloseInfo::ABNORMAL, "reset");
        settle().await;
        advance(Duration::from_secs(1)).await;
        assert_eq!(h.connector.attempts(), 2);
        assert!(!first.is_live());

        // a late event from the superseded connection changes nothing
        first.close(CloseInfo::ABNORMAL, "late");
        settle().await;
        assert_eq!(h.session.connection().phase, ConnectionPhase::Open);
        assert_eq!(h.connector.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failure_triggers_reconnect() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        advance(Duration::from_millis(1000)).await;

        // the server stops reading, so the next ping cannot be written
        h.connector.latest().sever();
        advance(Duration::from_secs(14)).await;
        assert_eq!(h.session.connection().phase, ConnectionPhase::Closed);
        assert_eq!(h.connector.attempts(), 1);

        advance(Duration::from_secs(1)).await;
        assert_eq!(h.connector.attempts(), 2);
        assert_eq!(h.session.connection().phase, ConnectionPhase::Open);
        assert_eq!(h.connector.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_updates_heartbeat_and_malformed_is_dropped() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        let remote = h.connector.latest();

        remote.push_raw("{not json");
        remote.push(json!({"type": "pong", "timestamp": 1}));
        settle().await;

        let connection = h.session.connection();
        assert_eq!(connection.phase, ConnectionPhase::Open);
        assert!(connection.last_heartbeat_at.is_some());
        assert!(remote.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_never_reaches_transport() {
        let h = harness();
        h.gate.set_allowed(false);
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        let remote = h.connector.latest();
        remote.take_frames();

        let result = h.session.send_command(stop("P1")).await;
        settle().await;

        assert!(matches!(result, Err(ControlError::PermissionDenied)));
        assert!(remote.take_messages("command").is_empty());
        assert!(h.session.pending_commands().is_empty());
        assert!(h.gateway.commands().is_empty());
        assert!(h.gateway.journal().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_command_is_rejected() {
        let h = harness();
        let result = h
            .session
            .send_command(ControlCommand::SetFrequency {
                device_name: "P1".to_string(),
                frequency: f64::NAN,
            })
            .await;

        assert!(matches!(result, Err(ControlError::Invalid(_))));
        assert!(h.gateway.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_fallback_when_not_connected() {
        let h = harness();
        h.gateway.set_full_state(json!({
            "dataGroups": [{"id": "pumps", "name": "Pumps", "type": "device",
                            "data": [{"name": "P1", "running": false}]}]
        }));

        let route = h.session.send_command(stop("P1")).await.unwrap();

        assert_eq!(route, CommandRoute::Http);
        assert_eq!(h.gateway.commands(), vec![("7".to_string(), stop("P1"))]);
        assert_eq!(h.gateway.fetches(), 1);
        assert_eq!(h.session.snapshot().device("P1").unwrap().running, Some(false));
        assert!(h.session.pending_commands().is_empty());

        h.gateway.fail_commands(true);
        let failed = h.session.send_command(stop("P1")).await;
        assert!(matches!(failed, Err(ControlError::Fallback(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_falls_back_to_http_without_snapshot() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        let fetches = h.gateway.fetches();
        let remote = h.connector.latest();

        // snapshot request after open goes unanswered
        advance(Duration::from_millis(1000)).await;
        assert_eq!(remote.take_messages("get_device_status").len(), 1);
        advance(Duration::from_secs(5)).await;
        assert_eq!(h.gateway.fetches(), fetches + 1);

        // an answered request cancels the fallback
        h.session.refresh().await.unwrap();
        remote.push(json!({"type": "device_status", "dataGroups": []}));
        settle().await;
        advance(Duration::from_secs(5)).await;
        assert_eq!(h.gateway.fetches(), fetches + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departments_update_permission() {
        let h = harness();
        h.gate.set_allowed(false);
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        assert!(!h.session.control_permitted());

        h.gate.set_allowed(true);
        h.connector
            .latest()
            .push(json!({"type": "device_status", "departments": ["operations"]}));
        settle().await;

        assert_eq!(h.gate.departments(), vec!["operations".to_string()]);
        assert!(h.session.control_permitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_sends_close_notice() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        let remote = h.connector.latest();
        remote.take_frames();

        h.session.shutdown("screen closed");
        settle().await;

        let frames = remote.take_frames();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(text).unwrap();
                assert_eq!(value["type"], "client_close");
                assert_eq!(value["reason"], "screen closed");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(frames[1], Frame::Close(CloseInfo::normal("screen closed")));
        assert!(!remote.is_live());

        h.session.focus(screen);
        advance(Duration::from_secs(120)).await;
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_only_while_focused_in_foreground() {
        let h = harness();
        h.connector.set_failing(true);
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        assert_eq!(h.gateway.fetches(), 1);

        advance(Duration::from_secs(30)).await;
        assert_eq!(h.gateway.fetches(), 2);

        h.session.blur(screen);
        advance(Duration::from_secs(90)).await;
        assert_eq!(h.gateway.fetches(), 2);

        h.session.focus(screen);
        settle().await;
        assert_eq!(h.gateway.fetches(), 3);

        h.session.set_foreground(false);
        advance(Duration::from_secs(90)).await;
        assert_eq!(h.gateway.fetches(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_event_merges_and_publishes() {
        let h = harness();
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;
        let remote = h.connector.latest();
        remote.push(json!({
            "type": "device_status",
            "dataGroups": [
                {"id": "valves", "name": "Valves", "type": "valve",
                 "data": [{"name": "V1", "open": false, "closed": true, "fault": false}]}
            ]
        }));
        settle().await;

        let mut events = h.session.subscribe();
        remote.push(json!({
            "type": "device_event",
            "eventType": "valve_fault",
            "valves": [{"name": "V1", "fault": 1}]
        }));
        settle().await;

        let valve = h.session.snapshot().valve("V1").cloned().unwrap();
        assert_eq!(valve.fault, Some(true));
        assert_eq!(valve.closed, Some(true));

        let mut device_events = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::DeviceEvent { event_type, .. } = event {
                device_events.push(event_type);
            }
        }
        assert_eq!(device_events, vec!["valve_fault".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_request_is_not_replayed_on_new_connection() {
        let mut config = ClientConfig::default();
        config.session.snapshot_delay_ms = 3000;
        let h = harness_with(config);
        let screen = h.session.attach_screen();
        h.session.focus(screen);
        settle().await;

        advance(Duration::from_millis(100)).await;
        h.connector.latest().close(1006, "network lost");
        settle().await;
        advance(Duration::from_millis(1000)).await;
        assert_eq!(h.connector.attempts(), 2);
        let second = h.connector.latest();

        // the first connection's request would have been due at 3s
        advance(Duration::from_millis(1900)).await;
        assert!(second.take_messages("get_device_status").is_empty());

        advance(Duration::from_millis(1200)).await;
        assert_eq!(second.take_messages("get_device_status").len(), 1);
    }
}
