//! burrow-tunnel: SSH reverse-tunnel managers for burrow
//!
//! The pieces fit together like this: a [`TunnelRegistry`] owns one manager
//! per configured tunnel. Each manager runs a reconnect state machine over
//! an [`SshTransport`] session; single tunnels keep one fixed remote
//! listener, full-mode sets scan the remote host and keep a listener per
//! admitted port. Accepted connections are relayed to the local target by
//! forwarder tasks, and every manager publishes into the shared
//! [`StatusBoard`].
//!
//! SSH is behind the [`Connector`] seam; production code plugs in
//! [`RusshConnector`], tests plug in a scripted mock.

pub mod forward;
pub mod registry;
pub mod scanner;
pub mod session;
pub mod set;
pub mod single;
pub mod status;
pub mod transport;
pub mod verify;

pub use registry::{RegistryError, TunnelRegistry};
pub use session::RusshConnector;
pub use set::TunnelSet;
pub use single::SingleTunnel;
pub use status::{SetStatus, StatusBoard, StatusCell};
pub use transport::{ConnectParams, Connector, Incoming, SshTransport};
pub use verify::{HostKeyPolicy, HostVerifier};
