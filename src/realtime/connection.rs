//! Connection lifecycle and reconnection policy.
//!
//! ```text
//! connecting ──▶ connected ──▶ disconnected ──▶ connecting ──▶ …
//!     │                              ▲
//!     └──── failed attempt ──────────┘      (5th failure) ──▶ error
//! ```
//!
//! Only an explicit client-initiated reconnect leaves `error`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::error::{ChannelError, ChannelResult};

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Backoff schedule: the first retry is immediate, then `base · 2^(k-2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before attempt `attempt` (1-based), `None` past the cap.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_attempts {
            return None;
        }
        if attempt <= 1 {
            return Some(Duration::ZERO);
        }
        Some(self.base_delay.saturating_mul(1u32 << (attempt - 2).min(16)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), 5)
    }
}

impl From<&RealtimeConfig> for ReconnectPolicy {
    fn from(config: &RealtimeConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            config.reconnect_max_attempts,
        )
    }
}

/// Client-side view of one logical connection.
#[derive(Debug, Clone)]
pub struct Connection {
    session_id: Option<String>,
    state: ConnectionState,
    last_heartbeat_at: Option<Instant>,
    reconnect_attempts: u32,
    policy: ReconnectPolicy,
}

impl Connection {
    /// New connection in `connecting`.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            session_id: None,
            state: ConnectionState::Connecting,
            last_heartbeat_at: None,
            reconnect_attempts: 0,
            policy,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Session bound by the last acknowledged handshake.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Failed attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.last_heartbeat_at
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Handshake acknowledged.
    pub fn on_connected(&mut self, session_id: impl Into<String>, now: Instant) -> ChannelResult<()> {
        self.transition(ConnectionState::Connecting, ConnectionState::Connected)?;
        self.session_id = Some(session_id.into());
        self.reconnect_attempts = 0;
        self.last_heartbeat_at = Some(now);
        info!(session_id = ?self.session_id, "Connection established");
        Ok(())
    }

    /// Any inbound traffic counts as liveness.
    pub fn on_traffic(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            self.last_heartbeat_at = Some(now);
        }
    }

    /// No traffic for `dead_after` or longer.
    pub fn is_stale(&self, now: Instant, dead_after: Duration) -> bool {
        match (self.state, self.last_heartbeat_at) {
            (ConnectionState::Connected, Some(last)) => now.saturating_duration_since(last) >= dead_after,
            _ => false,
        }
    }

    /// The live connection was lost (EOF, I/O error, dead heartbeat).
    pub fn on_disconnected(&mut self) -> ChannelResult<()> {
        self.transition(ConnectionState::Connected, ConnectionState::Disconnected)?;
        warn!(session_id = ?self.session_id, "Connection lost");
        Ok(())
    }

    /// A connect attempt failed. Returns the resulting state.
    pub fn on_connect_failed(&mut self) -> ChannelResult<ConnectionState> {
        if self.state != ConnectionState::Connecting {
            return Err(self.invalid(ConnectionState::Disconnected));
        }
        self.reconnect_attempts += 1;
        self.state = if self.reconnect_attempts >= self.policy.max_attempts {
            warn!(
                attempts = self.reconnect_attempts,
                "Reconnection attempts exhausted"
            );
            ConnectionState::Error
        } else {
            ConnectionState::Disconnected
        };
        Ok(self.state)
    }

    /// Move from `disconnected` back to `connecting` and return the delay to
    /// wait first.
    pub fn begin_reconnect(&mut self) -> ChannelResult<Duration> {
        if self.state == ConnectionState::Error {
            return Err(ChannelError::ReconnectExhausted {
                attempts: self.reconnect_attempts,
            });
        }
        self.transition(ConnectionState::Disconnected, ConnectionState::Connecting)?;

        let attempt = self.reconnect_attempts + 1;
        let delay = self
            .policy
            .delay_for(attempt)
            .ok_or(ChannelError::ReconnectExhausted {
                attempts: self.reconnect_attempts,
            })?;
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        Ok(delay)
    }

    /// Explicit client-initiated reconnect. The only way out of `error`.
    pub fn manual_reconnect(&mut self) -> ChannelResult<()> {
        match self.state {
            ConnectionState::Error | ConnectionState::Disconnected => {
                info!(
                    previous_attempts = self.reconnect_attempts,
                    "Manual reconnect requested"
                );
                self.state = ConnectionState::Connecting;
                self.reconnect_attempts = 0;
                Ok(())
            }
            _ => Err(self.invalid(ConnectionState::Connecting)),
        }
    }

    fn transition(&mut self, from: ConnectionState, to: ConnectionState) -> ChannelResult<()> {
        if self.state != from {
            return Err(self.invalid(to));
        }
        self.state = to;
        Ok(())
    }

    fn invalid(&self, to: ConnectionState) -> ChannelError {
        ChannelError::InvalidTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }
}
