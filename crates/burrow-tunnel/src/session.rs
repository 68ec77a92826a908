//! russh-backed implementation of the transport seam

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use russh_keys::load_secret_key;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use burrow_core::config::AuthMethod;
use burrow_core::TunnelError;

use crate::transport::{ConnectParams, Connector, Incoming, SshTransport};
use crate::verify::HostVerifier;

/// Buffer for connections accepted by remote listeners between the SSH
/// event handler and the manager task. 64 covers accept bursts without
/// holding many unserviced channels alive.
const INCOMING_CHANNEL_CAPACITY: usize = 64;

/// Upper bound on the keepalive probe; a session that cannot answer within
/// this is treated as lost.
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials real SSH sessions with russh.
#[derive(Debug, Default, Clone)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RusshConnector {
    type Transport = RusshTransport;

    async fn connect(&self, params: &ConnectParams) -> Result<RusshTransport, TunnelError> {
        let config = Arc::new(client::Config::default());
        let address = params.endpoint.address();

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let rejection = Arc::new(StdMutex::new(None));
        let handler = ClientHandler {
            verifier: HostVerifier::new(params.endpoint.host.clone(), params.host_key.clone()),
            incoming_tx,
            rejection: rejection.clone(),
        };

        debug!(address = %address, "connecting");
        let mut session = match tokio::time::timeout(
            params.connect_timeout,
            client::connect(config, address.as_str(), handler),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                // A host key rejection aborts the handshake inside russh;
                // recover the classified error recorded by the handler.
                if let Some(err) = take_rejection(&rejection) {
                    return Err(err);
                }
                return Err(classify_connect_error(&address, e));
            }
            Err(_) => {
                return Err(TunnelError::NetworkTimeout(format!(
                    "connecting to {}",
                    address
                )))
            }
        };

        let username = &params.endpoint.username;
        debug!(username = %username, "authenticating");
        let authenticated = match &params.auth {
            AuthMethod::Password { password } => session
                .authenticate_password(username.as_str(), password.as_str())
                .await
                .map_err(|e| TunnelError::Protocol(e.to_string()))?,
            AuthMethod::PrivateKey { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    warn!(path = %path.display(), error = %e, "failed to load private key");
                    TunnelError::AuthenticationFailure {
                        host: params.endpoint.host.clone(),
                        username: username.clone(),
                    }
                })?;
                session
                    .authenticate_publickey(username.as_str(), Arc::new(key))
                    .await
                    .map_err(|e| TunnelError::Protocol(e.to_string()))?
            }
        };

        if !authenticated {
            let _ = session
                .disconnect(Disconnect::ByApplication, "auth failed", "en")
                .await;
            return Err(TunnelError::AuthenticationFailure {
                host: params.endpoint.host.clone(),
                username: username.clone(),
            });
        }

        Ok(RusshTransport {
            handle: Mutex::new(session),
            incoming: Mutex::new(incoming_rx),
        })
    }
}

fn take_rejection(slot: &Arc<StdMutex<Option<TunnelError>>>) -> Option<TunnelError> {
    slot.lock().expect("rejection slot poisoned").take()
}

fn classify_connect_error(address: &str, err: russh::Error) -> TunnelError {
    classify_connect_message(address, err.to_string())
}

fn classify_connect_message(address: &str, message: String) -> TunnelError {
    if message.contains("refused") {
        TunnelError::ConnectionRefused(address.to_string())
    } else if message.contains("timed out") {
        TunnelError::NetworkTimeout(address.to_string())
    } else {
        TunnelError::Protocol(format!("{}: {}", address, message))
    }
}

/// One live russh session, exclusively owned by its manager.
pub struct RusshTransport {
    handle: Mutex<Handle<ClientHandler>>,
    incoming: Mutex<mpsc::Receiver<Incoming>>,
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn open_listener(&self, bind_addr: &str, port: u16) -> Result<(), TunnelError> {
        // The server answers a refused forward request with an error, not a
        // flag; on success it echoes the bound port.
        let bound = self
            .handle
            .lock()
            .await
            .tcpip_forward(bind_addr, port as u32)
            .await
            .map_err(|e| bind_refused(bind_addr, port, &e))?;
        debug!(bind = %format!("{}:{}", bind_addr, bound), "remote listener open");
        Ok(())
    }

    async fn close_listener(&self, bind_addr: &str, port: u16) -> Result<(), TunnelError> {
        self.handle
            .lock()
            .await
            .cancel_tcpip_forward(bind_addr, port as u32)
            .await
            .map_err(|e| TunnelError::ConnectionLost(e.to_string()))?;
        debug!(bind = %format!("{}:{}", bind_addr, port), "remote listener closed");
        Ok(())
    }

    async fn accept(&self) -> Option<Incoming> {
        self.incoming.lock().await.recv().await
    }

    async fn exec(&self, command: &str) -> Result<String, TunnelError> {
        let mut channel = self
            .handle
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|e| TunnelError::ConnectionLost(e.to_string()))?;
        channel
            .exec(true, command.as_bytes())
            .await
            .map_err(|e| TunnelError::ConnectionLost(e.to_string()))?;

        let mut output = String::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    output.push_str(&String::from_utf8_lossy(&data));
                }
                ChannelMsg::ExitStatus { .. } => {}
                ChannelMsg::Close | ChannelMsg::Eof => break,
                _ => {}
            }
        }
        let _ = channel.close().await;
        Ok(output)
    }

    async fn keepalive(&self) -> Result<(), TunnelError> {
        match tokio::time::timeout(KEEPALIVE_TIMEOUT, self.exec("true")).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TunnelError::ConnectionLost(e.to_string())),
            Err(_) => Err(TunnelError::ConnectionLost(
                "keepalive probe timed out".into(),
            )),
        }
    }

    async fn close(&self) {
        let _ = self
            .handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await;
    }
}

/// A denied forward request means the remote side would not bind the
/// listener; managers treat that as a bind conflict and retry.
fn bind_refused(bind_addr: &str, port: u16, reason: impl std::fmt::Display) -> TunnelError {
    warn!(
        bind = %format!("{}:{}", bind_addr, port),
        reason = %reason,
        "remote bind refused"
    );
    TunnelError::RemoteBindConflict {
        bind_addr: bind_addr.to_string(),
        port,
    }
}

/// SSH client handler: verifies the host key and hands connections accepted
/// by remote listeners over to the owning manager task.
struct ClientHandler {
    verifier: HostVerifier,
    incoming_tx: mpsc::Sender<Incoming>,
    /// Classified host key rejection, recovered by the connector after
    /// russh aborts the handshake
    rejection: Arc<StdMutex<Option<TunnelError>>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match self.verifier.verify(&fingerprint) {
            Ok(()) => Ok(true),
            Err(err) => {
                *self.rejection.lock().expect("rejection slot poisoned") = Some(err);
                Ok(false)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let incoming = Incoming {
            bound_addr: connected_address.to_string(),
            bound_port: connected_port as u16,
            origin_addr: originator_address.to_string(),
            origin_port: originator_port as u16,
            stream: Box::new(channel.into_stream()),
        };
        if self.incoming_tx.send(incoming).await.is_err() {
            // Manager is gone; the channel closes when `incoming` drops.
            debug!("dropping forwarded connection, manager no longer accepting");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_forward_request_maps_to_bind_conflict() {
        let err = bind_refused("127.0.0.1", 8080, "server denied the request");
        assert!(matches!(
            err,
            TunnelError::RemoteBindConflict { ref bind_addr, port: 8080 } if bind_addr == "127.0.0.1"
        ));
        assert!(!err.is_fatal());
    }

    #[test]
    fn connect_errors_classify_by_cause() {
        let refused =
            classify_connect_message("bastion.test:22", "connection refused".to_string());
        assert!(matches!(refused, TunnelError::ConnectionRefused(_)));

        let timeout = classify_connect_message("bastion.test:22", "timed out".to_string());
        assert!(matches!(timeout, TunnelError::NetworkTimeout(_)));
    }
}
