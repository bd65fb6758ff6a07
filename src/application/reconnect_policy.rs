// Reconnection policy - exponential backoff with a hard stop
use crate::domain::connection::CloseInfo;
use crate::infrastructure::config::ReconnectConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    /// Nothing scheduled; the connection is open or was never lost.
    Idle,
    Scheduled,
    Attempting,
    /// Attempts exhausted. Only an explicit re-arm resumes reconnection.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ReconnectionPolicy {
    config: ReconnectConfig,
    attempts: u32,
    phase: ReconnectPhase,
}

impl ReconnectionPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempts: 0,
            phase: ReconnectPhase::Idle,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.phase
    }

    pub fn is_stopped(&self) -> bool {
        self.phase == ReconnectPhase::Stopped
    }

    /// `min(base * multiplier^attempt, max)`, with an elevated base after a gateway fault.
    pub fn delay_for(&self, attempt: u32, close: &CloseInfo) -> Duration {
        let base = if close.indicates_gateway_fault() {
            self.config.gateway_fault_delay_ms
        } else {
            self.config.base_delay_ms
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = (base as f64 * self.config.multiplier.powi(exponent))
            .min(self.config.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Decide on a retry after an abnormal close. `None` means give up.
    pub fn on_abnormal_close(&mut self, close: &CloseInfo) -> Option<Duration> {
        if self.phase == ReconnectPhase::Stopped {
            return None;
        }
        if self.attempts >= self.config.max_attempts {
            tracing::warn!(
                "Reconnection stopped after {} attempts (last close: {} {})",
                self.attempts,
                close.code,
                close.reason
            );
            self.phase = ReconnectPhase::Stopped;
            return None;
        }

        let delay = self.delay_for(self.attempts, close);
        self.attempts += 1;
        self.phase = ReconnectPhase::Scheduled;
        Some(delay)
    }

    pub fn on_attempt(&mut self) {
        if self.phase == ReconnectPhase::Scheduled {
            self.phase = ReconnectPhase::Attempting;
        }
    }

    pub fn on_open(&mut self) {
        self.attempts = 0;
        self.phase = ReconnectPhase::Idle;
    }

    /// A scheduled retry was dropped (e.g. the screen lost focus).
    pub fn cancel(&mut self) {
        if matches!(self.phase, ReconnectPhase::Scheduled | ReconnectPhase::Attempting) {
            self.phase = ReconnectPhase::Idle;
        }
    }

    /// User-initiated retry after the policy gave up.
    pub fn rearm(&mut self) {
        if self.phase == ReconnectPhase::Stopped {
            self.attempts = 0;
            self.phase = ReconnectPhase::Idle;
        }
    }
}
