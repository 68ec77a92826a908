//! Core error types for burrow

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the burrow ecosystem
#[derive(Error, Debug)]
pub enum BurrowError {
    /// Tunnel/session error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session- and connection-level failures.
///
/// Every variant maps to an [`ErrorCode`]; the code decides whether the
/// owning state machine schedules a backoff retry or parks in `error`.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Credentials were rejected by the server
    #[error("Authentication failed for {username}@{host}")]
    AuthenticationFailure { host: String, username: String },

    /// Presented host key does not match the pinned fingerprint
    #[error("Host key mismatch for {host}: pinned {expected}, server presented {presented}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        presented: String,
    },

    /// Connect or handshake did not complete in time
    #[error("Connection timed out: {0}")]
    NetworkTimeout(String),

    /// TCP-level refusal from the server
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Established session dropped
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Server declined the remote listener bind
    #[error("Remote bind refused for {bind_addr}:{port}")]
    RemoteBindConflict { bind_addr: String, port: u16 },

    /// Dialing the local target failed (scoped to one forwarded connection)
    #[error("Local dial failed for {target}: {reason}")]
    LocalDialFailure { target: String, reason: String },

    /// The remote port probe could not run or produced no output
    #[error("Remote probe failed: {0}")]
    ProbeFailure(String),

    /// SSH protocol error
    #[error("SSH protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Classify this error for status reporting and retry policy.
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::AuthenticationFailure { .. } => ErrorCode::AuthenticationFailure,
            TunnelError::HostKeyMismatch { .. } => ErrorCode::HostKeyMismatch,
            TunnelError::NetworkTimeout(_) => ErrorCode::NetworkTimeout,
            TunnelError::ConnectionRefused(_) => ErrorCode::ConnectionRefused,
            TunnelError::ConnectionLost(_) => ErrorCode::ConnectionLost,
            TunnelError::RemoteBindConflict { .. } => ErrorCode::RemoteBindConflict,
            TunnelError::LocalDialFailure { .. } => ErrorCode::LocalDialFailure,
            TunnelError::ProbeFailure(_) => ErrorCode::ProbeFailure,
            TunnelError::Protocol(_) => ErrorCode::Protocol,
            TunnelError::Io(_) => ErrorCode::Io,
        }
    }

    /// Fatal errors are never retried automatically; the tunnel parks in
    /// `error` until the configuration (or the remote key) changes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::AuthenticationFailure | ErrorCode::HostKeyMismatch
        )
    }
}

/// Stable error classification carried in status snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthenticationFailure,
    HostKeyMismatch,
    NetworkTimeout,
    ConnectionRefused,
    ConnectionLost,
    RemoteBindConflict,
    LocalDialFailure,
    ProbeFailure,
    Protocol,
    Io,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::AuthenticationFailure => "authentication_failure",
            ErrorCode::HostKeyMismatch => "host_key_mismatch",
            ErrorCode::NetworkTimeout => "network_timeout",
            ErrorCode::ConnectionRefused => "connection_refused",
            ErrorCode::ConnectionLost => "connection_lost",
            ErrorCode::RemoteBindConflict => "remote_bind_conflict",
            ErrorCode::LocalDialFailure => "local_dial_failure",
            ErrorCode::ProbeFailure => "probe_failure",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Io => "io",
        };
        write!(f, "{}", s)
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Binding the remote listener on a wildcard address needs explicit consent
    #[error("Remote bind on {0} requires allow_public_bind = true")]
    PublicBindWithoutConsent(String),

    /// Strict checking with nothing to check against is a contradiction
    #[error("strict_host_key_checking = true requires host_key_fingerprint")]
    StrictWithoutFingerprint,
}
