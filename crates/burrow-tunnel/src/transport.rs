//! The capability seam between the tunnel state machines and SSH.
//!
//! Managers only ever talk to [`Connector`] and [`SshTransport`]; the russh
//! implementation lives in `session`, and integration tests drive the state
//! machines through a scripted mock instead of a live server.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use burrow_core::config::{AuthMethod, SshEndpoint};
use burrow_core::TunnelError;

use crate::verify::HostKeyPolicy;

/// Trait for streams carried through a tunnel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type alias for boxed tunnel streams.
pub type BoxedStream = Box<dyn TunnelStream>;

/// A connection accepted by a remote-side listener.
pub struct Incoming {
    /// Address the remote listener was bound on
    pub bound_addr: String,
    /// Port the remote listener was bound on; routes the connection to its tunnel
    pub bound_port: u16,
    /// Originator, for log context
    pub origin_addr: String,
    /// Originator port
    pub origin_port: u16,
    /// The accepted byte stream
    pub stream: BoxedStream,
}

/// Everything a manager needs to establish a session.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub endpoint: SshEndpoint,
    pub auth: AuthMethod,
    pub host_key: HostKeyPolicy,
    pub connect_timeout: Duration,
}

/// One established SSH session, exclusively owned by its manager.
#[async_trait]
pub trait SshTransport: Send + Sync + 'static {
    /// Request a remote listener on `bind_addr:port`.
    ///
    /// A server refusal surfaces as [`TunnelError::RemoteBindConflict`].
    async fn open_listener(&self, bind_addr: &str, port: u16) -> Result<(), TunnelError>;

    /// Cancel a remote listener.
    async fn close_listener(&self, bind_addr: &str, port: u16) -> Result<(), TunnelError>;

    /// Wait for the next connection accepted by any of this session's
    /// listeners. Returns `None` once the session is closed. Single
    /// consumer: only the owning manager task calls this.
    async fn accept(&self) -> Option<Incoming>;

    /// Execute a command on the remote host and capture its stdout.
    async fn exec(&self, command: &str) -> Result<String, TunnelError>;

    /// Session liveness probe.
    async fn keepalive(&self) -> Result<(), TunnelError>;

    /// Close the session. In-flight streams observe EOF.
    async fn close(&self);
}

/// Dials, verifies, and authenticates SSH sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: SshTransport;

    async fn connect(&self, params: &ConnectParams) -> Result<Self::Transport, TunnelError>;
}
