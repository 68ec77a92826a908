//! Connection forwarder: relays one accepted remote connection to a local
//! target until either side closes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::status::StatusCell;
use crate::transport::BoxedStream;

/// RAII handle for one live forwarded connection.
///
/// Increments its tunnel's `active_conns` on creation and decrements exactly
/// once on drop, whatever path the forwarder takes out, including a local
/// dial that never succeeded or an aborted task.
pub struct ConnGuard {
    cell: Arc<StatusCell>,
}

impl ConnGuard {
    pub fn new(cell: Arc<StatusCell>) -> Self {
        cell.conn_opened();
        Self { cell }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.cell.conn_closed();
    }
}

/// Relay one accepted connection to `target`.
///
/// Dial failures are scoped to this connection: they are logged and the
/// remote side is dropped, but the owning tunnel's state machine never
/// hears about them.
pub async fn relay(remote: BoxedStream, target: String, connect_timeout: Duration, guard: ConnGuard) {
    let local = match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(target = %target, error = %e, "local dial failed, dropping forwarded connection");
            return;
        }
        Err(_) => {
            warn!(target = %target, "local dial timed out, dropping forwarded connection");
            return;
        }
    };

    match relay_streams(remote, local).await {
        Ok((from_remote, from_local)) => {
            debug!(
                target = %target,
                rx = from_remote,
                tx = from_local,
                "forwarded connection closed"
            );
        }
        Err(e) => {
            debug!(target = %target, error = %e, "forwarded connection ended with error");
        }
    }

    drop(guard);
}

/// Copy bytes in both directions until EOF or error, then close both ends.
///
/// Half-close races (broken pipe, reset) at teardown are treated as a
/// graceful end.
pub(crate) async fn relay_streams<R, L>(mut remote: R, mut local: L) -> std::io::Result<(u64, u64)>
where
    R: AsyncRead + AsyncWrite + Unpin,
    L: AsyncRead + AsyncWrite + Unpin,
{
    let result = copy_bidirectional(&mut remote, &mut local).await;
    let _ = remote.shutdown().await;
    let _ = local.shutdown().await;
    match result {
        Ok(counts) => Ok(counts),
        Err(e)
            if e.kind() == std::io::ErrorKind::BrokenPipe
                || e.kind() == std::io::ErrorKind::NotConnected
                || e.kind() == std::io::ErrorKind::ConnectionReset =>
        {
            Ok((0, 0))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn relays_bytes_both_ways() {
        let (remote, mut remote_peer) = duplex(1024);
        let (local, mut local_peer) = duplex(1024);

        let task = tokio::spawn(relay_streams(remote, local));

        remote_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        local_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        local_peer.write_all(b"pong").await.unwrap();
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(remote_peer);
        drop(local_peer);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn guard_decrements_exactly_once() {
        let cell = StatusCell::new();
        {
            let _guard = ConnGuard::new(cell.clone());
            assert_eq!(cell.active_conns(), 1);
        }
        assert_eq!(cell.active_conns(), 0);
    }

    #[tokio::test]
    async fn dial_failure_releases_guard() {
        let cell = StatusCell::new();
        let (remote, _peer) = duplex(64);
        let guard = ConnGuard::new(cell.clone());
        // Port 1 on loopback is all but guaranteed closed.
        relay(
            Box::new(remote),
            "127.0.0.1:1".to_string(),
            Duration::from_millis(500),
            guard,
        )
        .await;
        assert_eq!(cell.active_conns(), 0);
    }
}
