//! Tunnel registry: owns every configured tunnel and routes lifecycle
//! operations to the right manager.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::info;

use burrow_core::config::TunnelKind;
use burrow_core::types::{StatusView, TestReport};
use burrow_core::{ConfigError, TunnelId, TunnelState};

use crate::set::TunnelSet;
use crate::single::SingleTunnel;
use crate::status::StatusBoard;
use crate::transport::Connector;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No tunnel with id '{0}'")]
    UnknownTunnel(TunnelId),

    #[error("A tunnel with id '{0}' already exists")]
    DuplicateId(TunnelId),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Owns the managers for every configured tunnel, single or full.
///
/// Creation validates and registers status; nothing connects until `start`.
pub struct TunnelRegistry<C: Connector> {
    connector: Arc<C>,
    board: Arc<StatusBoard>,
    tunnels: DashMap<TunnelId, TunnelEntry<C>>,
}

enum TunnelEntry<C: Connector> {
    Single(Arc<SingleTunnel<C>>),
    Full(Arc<TunnelSet<C>>),
}

impl<C: Connector> Clone for TunnelEntry<C> {
    fn clone(&self) -> Self {
        match self {
            TunnelEntry::Single(t) => TunnelEntry::Single(t.clone()),
            TunnelEntry::Full(s) => TunnelEntry::Full(s.clone()),
        }
    }
}

impl<C: Connector> TunnelEntry<C> {
    fn kind(&self) -> TunnelKind {
        match self {
            TunnelEntry::Single(t) => TunnelKind::Single(t.config().clone()),
            TunnelEntry::Full(s) => TunnelKind::Full(s.config().clone()),
        }
    }

    fn enabled(&self) -> bool {
        match self {
            TunnelEntry::Single(t) => t.config().enabled,
            TunnelEntry::Full(s) => s.config().enabled,
        }
    }

    /// The manager task is alive: forwarding, connecting, or parked on a
    /// backoff timer waiting to reconnect.
    fn is_running(&self) -> bool {
        let snapshot = match self {
            TunnelEntry::Single(t) => t.status().snapshot(),
            TunnelEntry::Full(s) => s.status().session.snapshot(),
        };
        match snapshot.state {
            TunnelState::Connecting | TunnelState::Forwarding => true,
            TunnelState::Error => snapshot.retry_in_ms.is_some(),
            TunnelState::Stopped => false,
        }
    }

    async fn start(&self) {
        match self {
            TunnelEntry::Single(t) => t.start().await,
            TunnelEntry::Full(s) => s.start().await,
        }
    }

    async fn stop(&self) {
        match self {
            TunnelEntry::Single(t) => t.stop().await,
            TunnelEntry::Full(s) => s.stop().await,
        }
    }

    async fn restart(&self) {
        match self {
            TunnelEntry::Single(t) => t.restart().await,
            TunnelEntry::Full(s) => s.restart().await,
        }
    }

    async fn test(&self) -> TestReport {
        match self {
            TunnelEntry::Single(t) => t.test().await,
            TunnelEntry::Full(s) => s.test().await,
        }
    }
}

impl<C: Connector> TunnelRegistry<C> {
    pub fn new(connector: Arc<C>) -> Self {
        Self {
            connector,
            board: Arc::new(StatusBoard::new()),
            tunnels: DashMap::new(),
        }
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Register a tunnel. Validates first; nothing invalid gets an entry.
    /// The tunnel stays `stopped` until started.
    pub fn create(&self, kind: TunnelKind) -> Result<TunnelId, RegistryError> {
        kind.validate()?;
        let id = kind.id().clone();
        match self.tunnels.entry(id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                info!(id = %id, name = %kind.name(), "tunnel registered");
                slot.insert(self.build(kind));
                Ok(id)
            }
        }
    }

    fn build(&self, kind: TunnelKind) -> TunnelEntry<C> {
        match kind {
            TunnelKind::Single(config) => {
                let cell = self.board.register_single(config.id.clone());
                TunnelEntry::Single(Arc::new(SingleTunnel::new(
                    config,
                    self.connector.clone(),
                    cell,
                )))
            }
            TunnelKind::Full(config) => {
                let status = self.board.register_set(config.id.clone());
                TunnelEntry::Full(Arc::new(TunnelSet::new(
                    config,
                    self.connector.clone(),
                    status,
                )))
            }
        }
    }

    fn entry(&self, id: &TunnelId) -> Result<TunnelEntry<C>, RegistryError> {
        self.tunnels
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| RegistryError::UnknownTunnel(id.clone()))
    }

    /// Replace a tunnel's configuration in place.
    ///
    /// The old manager is stopped before the swap; if it was running, the
    /// replacement starts immediately with a fresh backoff history.
    pub async fn update(&self, kind: TunnelKind) -> Result<(), RegistryError> {
        kind.validate()?;
        let id = kind.id().clone();
        let old = self.entry(&id)?;
        let was_running = old.is_running();
        old.stop().await;
        self.board.remove(&id);
        let replacement = self.build(kind);
        self.tunnels.insert(id.clone(), replacement.clone());
        info!(id = %id, restart = was_running, "tunnel updated");
        if was_running {
            replacement.start().await;
        }
        Ok(())
    }

    /// Stop and unregister a tunnel.
    pub async fn delete(&self, id: &TunnelId) -> Result<(), RegistryError> {
        let (_, entry) = self
            .tunnels
            .remove(id)
            .ok_or_else(|| RegistryError::UnknownTunnel(id.clone()))?;
        entry.stop().await;
        self.board.remove(id);
        info!(id = %id, "tunnel deleted");
        Ok(())
    }

    /// Duplicate a tunnel's configuration under a fresh id and register the
    /// copy, stopped.
    pub fn copy(&self, id: &TunnelId) -> Result<TunnelId, RegistryError> {
        let entry = self.entry(id)?;
        self.create(entry.kind().duplicate())
    }

    pub async fn start(&self, id: &TunnelId) -> Result<(), RegistryError> {
        self.entry(id)?.start().await;
        Ok(())
    }

    pub async fn stop(&self, id: &TunnelId) -> Result<(), RegistryError> {
        self.entry(id)?.stop().await;
        Ok(())
    }

    pub async fn restart(&self, id: &TunnelId) -> Result<(), RegistryError> {
        self.entry(id)?.restart().await;
        Ok(())
    }

    /// One-shot connectivity probe on a throwaway session.
    pub async fn test(&self, id: &TunnelId) -> Result<TestReport, RegistryError> {
        Ok(self.entry(id)?.test().await)
    }

    pub fn status(&self, id: &TunnelId) -> Option<StatusView> {
        self.board.view(id)
    }

    pub fn list(&self) -> Vec<(TunnelId, StatusView)> {
        self.board.list()
    }

    /// Start every tunnel marked `enabled`.
    pub async fn start_enabled(&self) {
        let entries: Vec<TunnelEntry<C>> = self
            .tunnels
            .iter()
            .filter(|r| r.value().enabled())
            .map(|r| r.value().clone())
            .collect();
        for entry in entries {
            entry.start().await;
        }
    }

    /// Stop everything, concurrently.
    pub async fn stop_all(&self) {
        let entries: Vec<TunnelEntry<C>> = self.tunnels.iter().map(|r| r.value().clone()).collect();
        futures::future::join_all(entries.iter().map(|e| e.stop())).await;
    }
}
