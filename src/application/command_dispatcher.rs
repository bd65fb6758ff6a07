// Command dispatcher - tracks in-flight control commands per target
use crate::application::events::SessionEvent;
use crate::application::transport::{send_text, Frame};
use crate::domain::command::{CommandStatus, ControlCommand, PendingCommand};
use crate::domain::protocol::{command_frame, CommandFeedback};
use crate::infrastructure::config::CommandConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no open connection")]
    NotConnected,
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connection dropped while sending")]
    SendFailed,
}

/// At most one pending entry exists per target; a newer command replaces the
/// older entry and the older acknowledgement is then ignored.
#[derive(Clone)]
pub struct CommandDispatcher {
    site_id: String,
    config: CommandConfig,
    pending: Arc<Mutex<HashMap<String, PendingCommand>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl CommandDispatcher {
    pub fn new(
        site_id: impl Into<String>,
        config: CommandConfig,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn pending(&self, target: &str) -> Option<PendingCommand> {
        self.lock().get(target).cloned()
    }

    pub fn pending_all(&self) -> Vec<PendingCommand> {
        let mut all: Vec<PendingCommand> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.target_name.cmp(&b.target_name));
        all
    }

    /// Send a command over the open connection and start tracking it.
    pub fn send(
        &self,
        outbound: Option<&mpsc::UnboundedSender<Frame>>,
        command: &ControlCommand,
    ) -> Result<PendingCommand, DispatchError> {
        let outbound = outbound.ok_or(DispatchError::NotConnected)?;

        let correlation_id = Uuid::new_v4().to_string();
        let frame = command_frame(
            &self.site_id,
            &correlation_id,
            command,
            chrono::Utc::now().timestamp_millis(),
        )?;

        let target = command.target().to_string();
        let entry = PendingCommand::new(target.clone(), correlation_id.clone());
        if let Some(previous) = self.lock().insert(target.clone(), entry.clone()) {
            if previous.status == CommandStatus::Pending {
                tracing::debug!(
                    "Command {} for {} superseded by {}",
                    previous.correlation_id,
                    target,
                    correlation_id
                );
            }
        }

        if send_text(outbound, frame).is_err() {
            self.remove_if_current(&target, &correlation_id);
            return Err(DispatchError::SendFailed);
        }

        tracing::info!(
            "Sent {} for {} on site {} ({})",
            command.kind(),
            target,
            self.site_id,
            correlation_id
        );
        self.publish(SessionEvent::Command(entry.clone()));
        self.arm_timeout(target, correlation_id);

        Ok(entry)
    }

    fn arm_timeout(&self, target: String, correlation_id: String) {
        let dispatcher = self.clone();
        let timeout = self.config.ack_timeout();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let expired = {
                let mut pending = dispatcher.lock();
                match pending.get_mut(&target) {
                    Some(entry)
                        if entry.correlation_id == correlation_id
                            && entry.status == CommandStatus::Pending =>
                    {
                        entry.status = CommandStatus::Timeout;
                        entry.message = Some(format!(
                            "no acknowledgement within {}s",
                            timeout.as_secs()
                        ));
                        Some(entry.clone())
                    }
                    _ => None,
                }
            };

            if let Some(entry) = expired {
                tracing::warn!("Command {} for {} timed out", correlation_id, target);
                dispatcher.publish(SessionEvent::Command(entry));
            }
        });
    }

    /// Resolve the pending entry an acknowledgement refers to.
    ///
    /// Matching is by correlation id when the gateway echoes one, otherwise by
    /// target name. Entries that already reached a terminal state are left alone.
    pub fn acknowledge(&self, feedback: &CommandFeedback) -> Option<PendingCommand> {
        let resolved = {
            let mut pending = self.lock();

            let key = match (&feedback.correlation_id, feedback.target()) {
                (Some(id), _) => pending
                    .iter()
                    .find(|(_, entry)| &entry.correlation_id == id)
                    .map(|(key, _)| key.clone()),
                (None, Some(target)) => pending.contains_key(target).then(|| target.to_string()),
                (None, None) => None,
            };

            let Some(key) = key else {
                tracing::debug!(
                    "Ignoring acknowledgement without a matching command: {:?}",
                    feedback
                );
                return None;
            };

            let entry = pending.get_mut(&key)?;
            if entry.status.is_terminal() {
                tracing::debug!(
                    "Ignoring late acknowledgement for {} ({:?})",
                    key,
                    entry.status
                );
                return None;
            }

            if feedback.success {
                entry.status = CommandStatus::Success;
                entry.message = feedback.message.clone();
            } else {
                entry.status = CommandStatus::Error;
                entry.message = Some(
                    feedback
                        .message
                        .clone()
                        .unwrap_or_else(|| "command failed".to_string()),
                );
            }
            entry.clone()
        };

        tracing::info!(
            "Command {} for {} finished: {:?}",
            resolved.correlation_id,
            resolved.target_name,
            resolved.status
        );
        self.publish(SessionEvent::Command(resolved.clone()));

        if resolved.status == CommandStatus::Success {
            self.schedule_clear(resolved.target_name.clone(), resolved.correlation_id.clone());
        }

        Some(resolved)
    }

    fn schedule_clear(&self, target: String, correlation_id: String) {
        let dispatcher = self.clone();
        let linger = self.config.success_linger();

        tokio::spawn(async move {
            tokio::time::sleep(linger).await;
            dispatcher.remove_if_current(&target, &correlation_id);
        });
    }

    fn remove_if_current(&self, target: &str, correlation_id: &str) {
        let removed = {
            let mut pending = self.lock();
            match pending.get(target) {
                Some(entry) if entry.correlation_id == correlation_id => {
                    pending.remove(target);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.publish(SessionEvent::CommandCleared {
                target: target.to_string(),
            });
        }
    }
}
