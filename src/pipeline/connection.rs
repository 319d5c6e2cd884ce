//! Source connection state machine.
//!
//! `Disconnected -> Connecting -> Streaming -> Disconnected`, owned by the
//! source's worker. Reconnect delays grow exponentially with the number of
//! consecutive failures and reset once a stream is established.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// State of one source connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected; waiting to (re)connect.
    Disconnected,
    /// Subscription in progress.
    Connecting,
    /// Receiving events.
    Streaming,
}

impl ConnectionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, target),
            (Disconnected, Connecting) | (Connecting, Streaming) | (Connecting, Disconnected) |
            (Streaming, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        // Up to 10% jitter so sources sharing a transport do not reconnect in lockstep.
        let spread = (base.as_millis() / 10) as u64;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Connection bookkeeping for one source worker.
#[derive(Debug, Clone)]
pub struct SourceConnection {
    source_id: String,
    state: ConnectionState,
    /// Consecutive failed connects/streams since the last successful stream.
    failures: u32,
    transitions: Vec<StateTransition>,
}

impl SourceConnection {
    /// Cap on retained transition history.
    const MAX_TRANSITIONS: usize = 50;

    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            state: ConnectionState::Disconnected,
            failures: 0,
            transitions: Vec::new(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn transitions(&self) -> &[StateTransition] {
        &self.transitions
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: ConnectionState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition {} from {} to {}",
                self.source_id, self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > Self::MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - Self::MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        match (self.state, new_state) {
            (ConnectionState::Connecting, ConnectionState::Streaming) => self.failures = 0,
            (_, ConnectionState::Disconnected) => self.failures = self.failures.saturating_add(1),
            _ => {}
        }

        self.state = new_state;
        Ok(())
    }
}
