//! Status aggregation: single-writer records, non-blocking reads

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use dashmap::DashMap;

use burrow_core::types::{ErrorInfo, SetSnapshot, StatusView, TunnelSnapshot};
use burrow_core::{TunnelId, TunnelState};

/// Status record for one tunnel (single, set session, or set child).
///
/// Written only by the owning manager task; read by anyone. State and error
/// live behind a short-critical-section lock, the connection count is an
/// atomic updated by forwarder guards.
pub struct StatusCell {
    inner: RwLock<CellState>,
    active: AtomicUsize,
}

struct CellState {
    state: TunnelState,
    last_error: Option<ErrorInfo>,
    retry_at: Option<Instant>,
}

impl StatusCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(CellState {
                state: TunnelState::Stopped,
                last_error: None,
                retry_at: None,
            }),
            active: AtomicUsize::new(0),
        })
    }

    /// Record a state transition. Clears any scheduled retry.
    pub fn set_state(&self, state: TunnelState) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.state = state;
        inner.retry_at = None;
    }

    /// Record an `error` transition with its classified reason.
    ///
    /// `retry_at` is the scheduled reconnect time for transient causes;
    /// fatal causes pass `None` and no retry is ever shown.
    pub fn set_error(&self, info: ErrorInfo, retry_at: Option<Instant>) {
        let mut inner = self.inner.write().expect("status lock poisoned");
        inner.state = TunnelState::Error;
        inner.last_error = Some(info);
        inner.retry_at = retry_at;
    }

    pub fn state(&self) -> TunnelState {
        self.inner.read().expect("status lock poisoned").state
    }

    pub fn active_conns(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn conn_opened(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn conn_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Non-blocking point-in-time snapshot.
    pub fn snapshot(&self) -> TunnelSnapshot {
        let inner = self.inner.read().expect("status lock poisoned");
        let retry_in_ms = inner
            .retry_at
            .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64);
        TunnelSnapshot {
            state: inner.state,
            active_conns: self.active.load(Ordering::Relaxed),
            last_error: inner.last_error.clone(),
            retry_in_ms,
        }
    }
}

/// Status record for a tunnel set: the shared session plus per-port children.
pub struct SetStatus {
    /// Session-level state; reflects the shared SSH session, not any child
    pub session: Arc<StatusCell>,
    children: DashMap<u16, Arc<StatusCell>>,
}

impl SetStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: StatusCell::new(),
            children: DashMap::new(),
        })
    }

    /// Get or create the record for a child, keyed by remote port
    pub fn child(&self, port: u16) -> Arc<StatusCell> {
        self.children
            .entry(port)
            .or_insert_with(StatusCell::new)
            .clone()
    }

    /// Look up a child without creating one. The accept path uses this so a
    /// connection racing a just-removed port cannot resurrect its record.
    pub fn existing_child(&self, port: u16) -> Option<Arc<StatusCell>> {
        self.children.get(&port).map(|r| r.value().clone())
    }

    pub fn remove_child(&self, port: u16) {
        self.children.remove(&port);
    }

    /// Drop all child records (session loss or set stop)
    pub fn clear_children(&self) {
        self.children.clear();
    }

    pub fn child_ports(&self) -> Vec<u16> {
        self.children.iter().map(|r| *r.key()).collect()
    }

    /// Aggregate snapshot: session state, summed connections, worst child
    pub fn snapshot(&self) -> SetSnapshot {
        let children: std::collections::BTreeMap<u16, TunnelSnapshot> = self
            .children
            .iter()
            .map(|r| (*r.key(), r.value().snapshot()))
            .collect();
        let active_conns_total = children.values().map(|c| c.active_conns).sum();
        let worst_child = children
            .values()
            .map(|c| c.state)
            .reduce(TunnelState::worst);
        SetSnapshot {
            session: self.session.snapshot(),
            active_conns_total,
            worst_child,
            children,
        }
    }
}

/// One record per registered tunnel
#[derive(Clone)]
pub enum StatusRecord {
    Single(Arc<StatusCell>),
    Full(Arc<SetStatus>),
}

impl StatusRecord {
    pub fn view(&self) -> StatusView {
        match self {
            StatusRecord::Single(cell) => StatusView::Single(cell.snapshot()),
            StatusRecord::Full(set) => StatusView::Full(set.snapshot()),
        }
    }
}

/// The status aggregator: read-mostly map of tunnel records.
///
/// Each record has exactly one writer (its owning manager); readers take
/// snapshots without touching the data path.
#[derive(Default)]
pub struct StatusBoard {
    records: DashMap<TunnelId, StatusRecord>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_single(&self, id: TunnelId) -> Arc<StatusCell> {
        let cell = StatusCell::new();
        self.records
            .insert(id, StatusRecord::Single(cell.clone()));
        cell
    }

    pub fn register_set(&self, id: TunnelId) -> Arc<SetStatus> {
        let set = SetStatus::new();
        self.records.insert(id, StatusRecord::Full(set.clone()));
        set
    }

    pub fn remove(&self, id: &TunnelId) {
        self.records.remove(id);
    }

    /// Snapshot one tunnel
    pub fn view(&self, id: &TunnelId) -> Option<StatusView> {
        self.records.get(id).map(|r| r.view())
    }

    /// Snapshot everything
    pub fn list(&self) -> Vec<(TunnelId, StatusView)> {
        self.records
            .iter()
            .map(|r| (r.key().clone(), r.value().view()))
            .collect()
    }
}
