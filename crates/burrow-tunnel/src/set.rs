//! Full-mode tunnel set: one SSH session carrying a listener per admitted
//! remote port, with the scanner driving admissions.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use burrow_core::backoff::BackoffState;
use burrow_core::config::TunnelSetConfig;
use burrow_core::types::{ErrorInfo, TestReport};
use burrow_core::{TunnelError, TunnelState};

use crate::forward::{relay, ConnGuard};
use crate::scanner::{scan, DebounceTracker};
use crate::single::{drain, keepalive_interval, probe_session, schedule_retry, AUTH_RETRY_LIMIT};
use crate::status::SetStatus;
use crate::transport::{ConnectParams, Connector, SshTransport};
use crate::verify::HostKeyPolicy;

/// Handle for one configured tunnel set.
///
/// Mirrors [`SingleTunnel`](crate::single::SingleTunnel): one manager task
/// owns the session, the scanner, and every child listener, and is the only
/// writer of this set's [`SetStatus`].
pub struct TunnelSet<C: Connector> {
    config: TunnelSetConfig,
    connector: Arc<C>,
    status: Arc<SetStatus>,
    cancel: StdMutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> TunnelSet<C> {
    pub fn new(config: TunnelSetConfig, connector: Arc<C>, status: Arc<SetStatus>) -> Self {
        Self {
            config,
            connector,
            status,
            cancel: StdMutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TunnelSetConfig {
        &self.config
    }

    pub fn status(&self) -> Arc<SetStatus> {
        self.status.clone()
    }

    /// Spawn the manager task. Starting an already-running set is a no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel slot poisoned") = Some(cancel.clone());
        info!(set = %self.config.name, "starting tunnel set");
        *task = Some(tokio::spawn(run_set(
            self.config.clone(),
            self.connector.clone(),
            self.status.clone(),
            cancel,
        )));
    }

    /// Cancel the manager task and wait for it to finish draining.
    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().expect("cancel slot poisoned").take() {
            cancel.cancel();
        }
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.status.clear_children();
        self.status.session.set_state(TunnelState::Stopped);
    }

    /// Stop, then start with a fresh backoff history.
    pub async fn restart(&self) {
        self.stop().await;
        self.start().await;
    }

    /// Probe connectivity on a throwaway session.
    pub async fn test(&self) -> TestReport {
        probe_session(self.connector.as_ref(), &connect_params(&self.config)).await
    }
}

fn connect_params(config: &TunnelSetConfig) -> ConnectParams {
    ConnectParams {
        endpoint: config.ssh.clone(),
        auth: config.auth.clone(),
        host_key: HostKeyPolicy::from_config(
            config.strict_host_key_checking,
            config.host_key_fingerprint.as_deref(),
        ),
        connect_timeout: config.timing.connect_timeout_ms,
    }
}

async fn run_set<C: Connector>(
    config: TunnelSetConfig,
    connector: Arc<C>,
    status: Arc<SetStatus>,
    cancel: CancellationToken,
) {
    let params = connect_params(&config);
    let mut backoff = BackoffState::new();
    let mut auth_failures: u32 = 0;

    loop {
        status.session.set_state(TunnelState::Connecting);

        let transport = tokio::select! {
            _ = cancel.cancelled() => {
                status.session.set_state(TunnelState::Stopped);
                return;
            }
            result = connector.connect(&params) => match result {
                Ok(transport) => transport,
                Err(e) => {
                    if matches!(e, TunnelError::AuthenticationFailure { .. }) {
                        auth_failures += 1;
                    }
                    let park = match &e {
                        TunnelError::HostKeyMismatch { .. } => true,
                        TunnelError::AuthenticationFailure { .. } => {
                            auth_failures > AUTH_RETRY_LIMIT
                        }
                        _ => false,
                    };
                    if park {
                        warn!(set = %config.name, error = %e, "fatal error, set parked");
                        status.session.set_error(ErrorInfo::from(&e), None);
                        return;
                    }
                    if !schedule_retry(
                        &config.name,
                        &config.timing,
                        &status.session,
                        &cancel,
                        &mut backoff,
                        &e,
                    )
                    .await
                    {
                        return;
                    }
                    continue;
                }
            }
        };

        status.session.set_state(TunnelState::Forwarding);
        backoff.reset();
        auth_failures = 0;
        info!(set = %config.name, target = %config.local_addr, "session up, scanning");

        // Admission history does not survive the session: after a reconnect
        // every port re-earns its listener through the debounce window.
        let mut tracker = DebounceTracker::new(config.scan.debounce_ms);
        let mut open_listeners: BTreeSet<u16> = BTreeSet::new();
        let mut forwarders: JoinSet<()> = JoinSet::new();
        let mut keepalive = keepalive_interval(config.timing.keepalive_interval_ms);
        let mut scan_tick = tokio::time::interval(config.scan.scan_interval_ms);
        scan_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let lost: TunnelError = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    for port in &open_listeners {
                        let _ = transport.close_listener(&config.remote_bind_addr, *port).await;
                    }
                    transport.close().await;
                    drain(&mut forwarders, config.timing.drain_grace_ms).await;
                    status.clear_children();
                    status.session.set_state(TunnelState::Stopped);
                    info!(set = %config.name, "tunnel set stopped");
                    return;
                }
                incoming = transport.accept() => match incoming {
                    Some(incoming) => {
                        let port = incoming.bound_port;
                        let Some(cell) = status.existing_child(port) else {
                            debug!(
                                set = %config.name,
                                port,
                                "dropping connection for a port with no child"
                            );
                            continue;
                        };
                        debug!(
                            set = %config.name,
                            port,
                            origin = %format!("{}:{}", incoming.origin_addr, incoming.origin_port),
                            "accepted forwarded connection"
                        );
                        let guard = ConnGuard::new(cell);
                        forwarders.spawn(relay(
                            incoming.stream,
                            format!("{}:{}", config.local_addr, port),
                            config.timing.connect_timeout_ms,
                            guard,
                        ));
                    }
                    None => break TunnelError::ConnectionLost("session closed".into()),
                },
                _ = scan_tick.tick() => {
                    match scan(&transport).await {
                        Ok(present) => {
                            let admitted = config.filter.admit(&present);
                            let delta = tracker.observe(Instant::now(), &admitted);
                            if !delta.is_empty() {
                                debug!(
                                    set = %config.name,
                                    added = ?delta.added,
                                    removed = ?delta.removed,
                                    "admission change confirmed"
                                );
                            }
                            if let Err(e) = converge(
                                &config,
                                &transport,
                                &status,
                                tracker.admitted(),
                                &mut open_listeners,
                            )
                            .await
                            {
                                break e;
                            }
                        }
                        Err(e) => break e,
                    }
                }
                _ = keepalive.tick() => {
                    if let Err(e) = transport.keepalive().await {
                        break e;
                    }
                }
                Some(_) = forwarders.join_next(), if !forwarders.is_empty() => {}
            }
        };

        transport.close().await;
        drain(&mut forwarders, config.timing.drain_grace_ms).await;
        status.clear_children();
        if !schedule_retry(
            &config.name,
            &config.timing,
            &status.session,
            &cancel,
            &mut backoff,
            &lost,
        )
        .await
        {
            return;
        }
    }
}

/// Bring the open listeners in line with the admitted port set.
///
/// A bind refusal is scoped to that port: the child parks in `error` and
/// the port is retried on the next scan cycle. Any other failure is a
/// session-level error and bubbles up.
async fn converge<T: SshTransport + ?Sized>(
    config: &TunnelSetConfig,
    transport: &T,
    status: &SetStatus,
    admitted: &BTreeSet<u16>,
    open_listeners: &mut BTreeSet<u16>,
) -> Result<(), TunnelError> {
    let to_close: Vec<u16> = open_listeners
        .iter()
        .copied()
        .filter(|p| !admitted.contains(p))
        .collect();
    for port in to_close {
        transport
            .close_listener(&config.remote_bind_addr, port)
            .await?;
        open_listeners.remove(&port);
        status.remove_child(port);
        info!(set = %config.name, port, "listener closed, remote port gone");
    }

    for &port in admitted {
        if open_listeners.contains(&port) {
            continue;
        }
        match transport.open_listener(&config.remote_bind_addr, port).await {
            Ok(()) => {
                open_listeners.insert(port);
                status.child(port).set_state(TunnelState::Forwarding);
                info!(
                    set = %config.name,
                    port,
                    target = %format!("{}:{}", config.local_addr, port),
                    "listener open"
                );
            }
            Err(e @ TunnelError::RemoteBindConflict { .. }) => {
                warn!(set = %config.name, port, error = %e, "bind refused, will retry next scan");
                status.child(port).set_error(ErrorInfo::from(&e), None);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
