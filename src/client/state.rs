//! Connection lifecycle state machine
//!
//! Pure transition logic; the connection manager applies the result and
//! publishes it on its watch channel.

use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Connection state as seen by observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Down with the last reason; the next `ensure_usable` reconnects
    Disconnected(String),
    Connecting,
    Connected,
    /// Reconnect in progress (attempt number)
    Reconnecting(u32),
    /// Shut down by `close()`. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// Things that happen to a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectStarted,
    /// Attempt number of a reconnect that follows a lost session
    ReconnectStarted(u32),
    Established,
    Lost(String),
    ConnectFailed(String),
    CloseRequested,
}

/// Next state after `event`. `Closed` absorbs every event.
pub fn determine_next_state(current: &ConnectionState, event: ConnectionEvent) -> ConnectionState {
    if *current == ConnectionState::Closed {
        return ConnectionState::Closed;
    }

    match event {
        ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
        ConnectionEvent::ReconnectStarted(attempt) => ConnectionState::Reconnecting(attempt),
        ConnectionEvent::Established => ConnectionState::Connected,
        ConnectionEvent::Lost(reason) | ConnectionEvent::ConnectFailed(reason) => {
            ConnectionState::Disconnected(reason)
        }
        ConnectionEvent::CloseRequested => ConnectionState::Closed,
    }
}

pub fn can_publish(state: &ConnectionState) -> bool {
    matches!(state, ConnectionState::Connected)
}

pub fn log_state_transition(identity: &str, from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (_, ConnectionState::Connected) => {
            info!(identity = %identity, from = %from, "Connection established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
            warn!(identity = %identity, reason = %reason, "Connection lost");
        }
        (_, ConnectionState::Disconnected(reason)) => {
            error!(identity = %identity, reason = %reason, "Connection attempt failed");
        }
        (_, ConnectionState::Reconnecting(attempt)) => {
            info!(identity = %identity, attempt, "Reconnecting");
        }
        (_, ConnectionState::Closed) => {
            info!(identity = %identity, "Connection closed");
        }
        _ => {
            tracing::debug!(identity = %identity, "Connection state: {} -> {}", from, to);
        }
    }
}

/// Point-in-time health of a connection
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub state: ConnectionState,
    /// Time since the current session was established
    pub uptime: Option<Duration>,
    /// Time since the last successful broker operation
    pub idle: Option<Duration>,
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

impl HealthMetrics {
    pub fn calculate(
        state: ConnectionState,
        connected_at: Option<Instant>,
        last_activity: Option<Instant>,
        reconnect_count: u32,
    ) -> Self {
        let now = Instant::now();
        let uptime = connected_at.map(|t| now.duration_since(t));
        let idle = last_activity.map(|t| now.duration_since(t));
        let is_healthy = can_publish(&state) && uptime.is_some();

        Self {
            state,
            uptime,
            idle,
            reconnect_count,
            is_healthy,
        }
    }
}
