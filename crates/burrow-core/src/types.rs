//! Core domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{ErrorCode, TunnelError};

/// Unique identifier for a tunnel or tunnel set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TunnelId(pub String);

impl TunnelId {
    /// Create a new tunnel ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random ID
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TunnelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TunnelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a tunnel (single, set session, or set child)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Not running; only an explicit start leaves this state
    Stopped,
    /// Opening the SSH session, or waiting out a backoff delay
    Connecting,
    /// Session up and the remote listener is accepting
    Forwarding,
    /// Last attempt failed; `retry_in` tells whether a reconnect is scheduled
    Error,
}

impl TunnelState {
    /// Ordering used when rolling a set's children up for display:
    /// an errored child outweighs a connecting one, which outweighs the rest.
    fn severity(self) -> u8 {
        match self {
            TunnelState::Error => 3,
            TunnelState::Connecting => 2,
            TunnelState::Stopped => 1,
            TunnelState::Forwarding => 0,
        }
    }

    /// The worse of two states for aggregate display
    pub fn worst(self, other: TunnelState) -> TunnelState {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Stopped => write!(f, "stopped"),
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Forwarding => write!(f, "forwarding"),
            TunnelState::Error => write!(f, "error"),
        }
    }
}

/// Classified reason attached to an `error` transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error class
    pub code: ErrorCode,
    /// Human-readable reason
    pub message: String,
    /// Fatal errors have no retry scheduled
    pub fatal: bool,
}

impl From<&TunnelError> for ErrorInfo {
    fn from(err: &TunnelError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            fatal: err.is_fatal(),
        }
    }
}

/// Point-in-time status of one tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSnapshot {
    /// Current lifecycle state
    pub state: TunnelState,
    /// Count of live forwarded connections
    pub active_conns: usize,
    /// Last error, if any
    pub last_error: Option<ErrorInfo>,
    /// Milliseconds until the next reconnect attempt, when one is scheduled
    pub retry_in_ms: Option<u64>,
}

impl TunnelSnapshot {
    /// A snapshot for a tunnel that has never been started
    pub fn stopped() -> Self {
        Self {
            state: TunnelState::Stopped,
            active_conns: 0,
            last_error: None,
            retry_in_ms: None,
        }
    }
}

/// Point-in-time status of a tunnel set: the shared session plus a
/// drill-down of children keyed by remote port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetSnapshot {
    /// State of the shared SSH session (not of any individual child)
    pub session: TunnelSnapshot,
    /// Sum of children's active connections
    pub active_conns_total: usize,
    /// Worst child state, for display rollup
    pub worst_child: Option<TunnelState>,
    /// Per-child status keyed by remote port
    pub children: BTreeMap<u16, TunnelSnapshot>,
}

/// Status of either flavor of tunnel, as read through the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StatusView {
    Single(TunnelSnapshot),
    Full(SetSnapshot),
}

/// Result of a one-shot connectivity test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Whether connect + verify + auth succeeded
    pub success: bool,
    /// Round trip time for the connect/verify/disconnect cycle
    #[serde(with = "crate::config::serde_utils::duration_ms")]
    pub latency: Duration,
    /// Failure reason, when unsuccessful
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_state_rollup() {
        assert_eq!(
            TunnelState::Forwarding.worst(TunnelState::Error),
            TunnelState::Error
        );
        assert_eq!(
            TunnelState::Connecting.worst(TunnelState::Forwarding),
            TunnelState::Connecting
        );
        assert_eq!(
            TunnelState::Forwarding.worst(TunnelState::Forwarding),
            TunnelState::Forwarding
        );
    }

    #[test]
    fn tunnel_id_display() {
        let id = TunnelId::new("web-tunnel");
        assert_eq!(id.to_string(), "web-tunnel");
        assert_eq!(id.as_str(), "web-tunnel");
    }

    #[test]
    fn random_ids_are_unique() {
        assert_ne!(TunnelId::random(), TunnelId::random());
    }
}
