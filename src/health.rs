//! Feed health tracking
//!
//! Holds only derived statistics: message and error timestamps in a sliding window plus
//! the current connection state. Never touches the transport or the store.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::websocket::ConnectionState;

/// Most recent error kinds kept for reporting
const RECENT_ERRORS_CAP: usize = 100;

/// Health thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct HealthConfig {
    /// Sliding window for rates
    pub window: Duration,
    /// Max silence while subscribed
    pub stale_threshold: Duration,
    /// Max errors / (messages + errors) in the window
    pub error_rate_threshold: f64,
    /// Max time in Degraded or Reconnecting
    pub degraded_grace: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(60),
            error_rate_threshold: 0.10,
            degraded_grace: Duration::from_secs(30),
        }
    }
}

/// Point-in-time health report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub state: ConnectionState,
    /// Since the monitor was created
    pub uptime_secs: f64,
    pub time_in_state_secs: f64,
    pub messages_per_second: f64,
    /// `None` until the first message after subscribing
    pub seconds_since_last_message: Option<f64>,
    pub messages_in_window: usize,
    pub errors_in_window: usize,
    pub error_rate: f64,
    pub total_messages: u64,
    pub total_errors: u64,
    pub recent_errors: Vec<String>,
    /// Reasons for `healthy == false`
    pub issues: Vec<String>,
}

/// Sliding-window health statistics
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    messages: VecDeque<Instant>,
    errors: VecDeque<Instant>,
    recent_errors: VecDeque<String>,
    total_messages: u64,
    total_errors: u64,
    last_message: Option<Instant>,
    state: ConnectionState,
    state_since: Instant,
    subscribed_at: Option<Instant>,
    started_at: Instant,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, now: Instant) -> Self {
        Self {
            config,
            messages: VecDeque::new(),
            errors: VecDeque::new(),
            recent_errors: VecDeque::new(),
            total_messages: 0,
            total_errors: 0,
            last_message: None,
            state: ConnectionState::Disconnected,
            state_since: now,
            subscribed_at: None,
            started_at: now,
        }
    }

    pub fn record_message(&mut self, now: Instant) {
        self.messages.push_back(now);
        self.total_messages += 1;
        self.last_message = Some(now);
        self.prune(now);
    }

    /// Count an error of the given kind (malformed frame, parse error, ...)
    pub fn record_error(&mut self, kind: &str, now: Instant) {
        self.errors.push_back(now);
        self.total_errors += 1;
        if self.recent_errors.len() == RECENT_ERRORS_CAP {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(kind.to_string());
        self.prune(now);
    }

    pub fn set_connection_state(&mut self, state: ConnectionState, now: Instant) {
        if state == self.state {
            return;
        }
        self.state = state;
        self.state_since = now;
        self.subscribed_at = (state == ConnectionState::Subscribed).then_some(now);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.window;
        let expired = |t: &Instant| now.saturating_duration_since(*t) > window;
        while self.messages.front().is_some_and(expired) {
            self.messages.pop_front();
        }
        while self.errors.front().is_some_and(expired) {
            self.errors.pop_front();
        }
    }

    pub fn snapshot(&mut self, now: Instant) -> HealthSnapshot {
        self.prune(now);

        let window_secs = self.config.window.as_secs_f64().max(1.0);
        let messages = self.messages.len();
        let errors = self.errors.len();
        let error_rate = if messages + errors == 0 {
            0.0
        } else {
            errors as f64 / (messages + errors) as f64
        };
        let time_in_state = now.saturating_duration_since(self.state_since);

        let mut issues = Vec::new();

        if self.state == ConnectionState::Subscribed {
            let reference = match (self.last_message, self.subscribed_at) {
                (Some(last), Some(since)) => Some(last.max(since)),
                (last, since) => last.or(since),
            };
            if let Some(reference) = reference {
                let silent = now.saturating_duration_since(reference);
                if silent > self.config.stale_threshold {
                    issues.push(format!(
                        "no messages for {:.0}s (threshold {}s)",
                        silent.as_secs_f64(),
                        self.config.stale_threshold.as_secs()
                    ));
                }
            }
        }

        if error_rate > self.config.error_rate_threshold {
            issues.push(format!(
                "error rate {:.1}% above {:.1}%",
                error_rate * 100.0,
                self.config.error_rate_threshold * 100.0
            ));
        }

        match self.state {
            ConnectionState::Degraded | ConnectionState::Reconnecting
                if time_in_state > self.config.degraded_grace =>
            {
                issues.push(format!(
                    "{} for {:.0}s",
                    self.state,
                    time_in_state.as_secs_f64()
                ));
            }
            ConnectionState::Closed => issues.push("connection closed".to_string()),
            _ => {}
        }

        HealthSnapshot {
            healthy: issues.is_empty(),
            state: self.state,
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs_f64(),
            time_in_state_secs: time_in_state.as_secs_f64(),
            messages_per_second: messages as f64 / window_secs,
            seconds_since_last_message: self
                .last_message
                .map(|last| now.saturating_duration_since(last).as_secs_f64()),
            messages_in_window: messages,
            errors_in_window: errors,
            error_rate,
            total_messages: self.total_messages,
            total_errors: self.total_errors,
            recent_errors: self.recent_errors.iter().cloned().collect(),
            issues,
        }
    }
}
