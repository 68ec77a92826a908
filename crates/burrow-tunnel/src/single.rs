//! Single fixed-port tunnel: one SSH session, one remote listener, one
//! reconnect state machine.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use burrow_core::backoff::{jittered, BackoffState};
use burrow_core::config::{TimingConfig, TunnelConfig};
use burrow_core::types::{ErrorInfo, TestReport};
use burrow_core::{TunnelError, TunnelState};

use crate::forward::{relay, ConnGuard};
use crate::status::StatusCell;
use crate::transport::{ConnectParams, Connector, SshTransport};
use crate::verify::HostKeyPolicy;

/// Consecutive credential rejections tolerated before the tunnel parks.
/// A server-side hiccup can reject a valid credential once; a credential
/// that keeps failing will not fix itself by retrying.
pub(crate) const AUTH_RETRY_LIMIT: u32 = 2;

/// Fraction of the backoff delay added as random jitter so a fleet of
/// tunnels knocked out together does not reconnect in lockstep.
const RETRY_JITTER: f64 = 0.1;

/// Handle for one configured single tunnel.
///
/// `start` spawns the manager task; everything the tunnel does afterwards
/// happens inside that task, which owns the session exclusively and is the
/// only writer of this tunnel's [`StatusCell`].
pub struct SingleTunnel<C: Connector> {
    config: TunnelConfig,
    connector: Arc<C>,
    status: Arc<StatusCell>,
    cancel: StdMutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> SingleTunnel<C> {
    pub fn new(config: TunnelConfig, connector: Arc<C>, status: Arc<StatusCell>) -> Self {
        Self {
            config,
            connector,
            status,
            cancel: StdMutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn status(&self) -> Arc<StatusCell> {
        self.status.clone()
    }

    /// Spawn the manager task. Starting an already-running tunnel is a
    /// no-op.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock().expect("cancel slot poisoned") = Some(cancel.clone());
        info!(tunnel = %self.config.name, "starting tunnel");
        *task = Some(tokio::spawn(run_single(
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
        self.status.set_state(TunnelState::Stopped);
    }

    /// Stop, then start with a fresh backoff history. The first reconnect
    /// attempt after a restart is immediate.
    pub async fn restart(&self) {
        self.stop().await;
        self.start().await;
    }

    /// Probe connectivity on a throwaway session, without touching the
    /// running tunnel.
    pub async fn test(&self) -> TestReport {
        probe_session(self.connector.as_ref(), &connect_params(&self.config)).await
    }
}

fn connect_params(config: &TunnelConfig) -> ConnectParams {
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

/// Connect, close, report. Shared by single and set `test` operations.
pub(crate) async fn probe_session<C: Connector>(
    connector: &C,
    params: &ConnectParams,
) -> TestReport {
    let started = Instant::now();
    match connector.connect(params).await {
        Ok(transport) => {
            transport.close().await;
            TestReport {
                success: true,
                latency: started.elapsed(),
                error: None,
            }
        }
        Err(e) => TestReport {
            success: false,
            latency: started.elapsed(),
            error: Some(e.to_string()),
        },
    }
}

async fn run_single<C: Connector>(
    config: TunnelConfig,
    connector: Arc<C>,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
) {
    let params = connect_params(&config);
    let mut backoff = BackoffState::new();
    let mut auth_failures: u32 = 0;

    loop {
        status.set_state(TunnelState::Connecting);

        let transport = tokio::select! {
            _ = cancel.cancelled() => {
                status.set_state(TunnelState::Stopped);
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
                        warn!(tunnel = %config.name, error = %e, "fatal error, tunnel parked");
                        status.set_error(ErrorInfo::from(&e), None);
                        return;
                    }
                    if !schedule_retry(&config.name, &config.timing, &status, &cancel, &mut backoff, &e).await {
                        return;
                    }
                    continue;
                }
            }
        };

        if let Err(e) = transport
            .open_listener(&config.remote_bind_addr, config.remote_port)
            .await
        {
            transport.close().await;
            if !schedule_retry(&config.name, &config.timing, &status, &cancel, &mut backoff, &e).await {
                return;
            }
            continue;
        }

        status.set_state(TunnelState::Forwarding);
        backoff.reset();
        auth_failures = 0;
        info!(
            tunnel = %config.name,
            remote = %format!("{}:{}", config.remote_bind_addr, config.remote_port),
            target = %config.local_target(),
            "forwarding"
        );

        let mut forwarders: JoinSet<()> = JoinSet::new();
        let mut keepalive = keepalive_interval(config.timing.keepalive_interval_ms);

        let lost: TunnelError = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = transport
                        .close_listener(&config.remote_bind_addr, config.remote_port)
                        .await;
                    transport.close().await;
                    drain(&mut forwarders, config.timing.drain_grace_ms).await;
                    status.set_state(TunnelState::Stopped);
                    info!(tunnel = %config.name, "tunnel stopped");
                    return;
                }
                incoming = transport.accept() => match incoming {
                    Some(incoming) => {
                        debug!(
                            tunnel = %config.name,
                            origin = %format!("{}:{}", incoming.origin_addr, incoming.origin_port),
                            "accepted forwarded connection"
                        );
                        let guard = ConnGuard::new(status.clone());
                        forwarders.spawn(relay(
                            incoming.stream,
                            config.local_target(),
                            config.timing.connect_timeout_ms,
                            guard,
                        ));
                    }
                    None => break TunnelError::ConnectionLost("session closed".into()),
                },
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
        if !schedule_retry(&config.name, &config.timing, &status, &cancel, &mut backoff, &lost).await {
            return;
        }
    }
}

/// Record the failure, schedule the next attempt, and sleep it out.
/// Returns `false` when cancelled during the wait.
pub(crate) async fn schedule_retry(
    name: &str,
    timing: &TimingConfig,
    status: &StatusCell,
    cancel: &CancellationToken,
    backoff: &mut BackoffState,
    error: &TunnelError,
) -> bool {
    let base = backoff.next_delay(timing.backoff_base_ms, timing.backoff_max_ms);
    let delay = jittered(base, timing.backoff_max_ms, RETRY_JITTER);
    warn!(
        tunnel = %name,
        error = %error,
        attempt = backoff.attempt(),
        retry_in_ms = delay.as_millis() as u64,
        "tunnel down, reconnect scheduled"
    );
    status.set_error(ErrorInfo::from(error), Some(Instant::now() + delay));
    tokio::select! {
        _ = cancel.cancelled() => {
            status.set_state(TunnelState::Stopped);
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Keepalive ticker that does not fire immediately on creation.
pub(crate) fn keepalive_interval(period: Duration) -> tokio::time::Interval {
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

/// Give in-flight forwarders `grace` to finish, then abort the stragglers.
/// Their guards drop either way, so the connection count always lands on
/// zero.
pub(crate) async fn drain(forwarders: &mut JoinSet<()>, grace: Duration) {
    if forwarders.is_empty() {
        return;
    }
    let finished = tokio::time::timeout(grace, async {
        while forwarders.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        debug!(remaining = forwarders.len(), "drain grace expired, aborting forwarders");
        forwarders.abort_all();
        while forwarders.join_next().await.is_some() {}
    }
}
