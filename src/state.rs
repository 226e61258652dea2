//! Connection state shared between the lifecycle controller and the liveness monitor.

use std::sync::Mutex;

/// Read-only snapshot of the process-wide connection flags.
///
/// `connected` is a best-effort liveness signal and may be stale by up to one
/// probe interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub connected: bool,
    pub migrated: bool,
}

/// `Uninitialized -> Connected -> Migrated`, with `Closed` reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Connected,
    Migrated,
    Closed,
}

impl LifecycleState {
    /// Whether a live handle should exist in this state.
    pub fn is_open(self) -> bool {
        matches!(self, LifecycleState::Connected | LifecycleState::Migrated)
    }
}

#[derive(Debug, Default)]
struct Inner {
    connected: bool,
    migrated: bool,
    lifecycle: LifecycleState,
    // Advanced by close(); monitors write only while their epoch is current
    epoch: u64,
}

/// Mutable state behind [`ConnectionState`].
///
/// The controller owns every transition; monitors may only flip `connected`,
/// and only for the epoch they were started in.
#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<Inner>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut inner)
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.with(|inner| ConnectionState {
            connected: inner.connected,
            migrated: inner.migrated,
        })
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.with(|inner| inner.lifecycle)
    }

    /// Enters `Connected` and returns the epoch a monitor should be started with.
    pub fn mark_connected(&self) -> u64 {
        self.with(|inner| {
            inner.connected = true;
            inner.migrated = false;
            inner.lifecycle = LifecycleState::Connected;
            inner.epoch
        })
    }

    /// Enters `Migrated`. Refused unless a connection is open.
    pub fn mark_migrated(&self) -> bool {
        self.with(|inner| {
            if !inner.lifecycle.is_open() {
                return false;
            }
            inner.migrated = true;
            inner.lifecycle = LifecycleState::Migrated;
            true
        })
    }

    /// Enters `Closed` and invalidates every running monitor.
    pub fn mark_closed(&self) {
        self.with(|inner| {
            inner.epoch += 1;
            inner.connected = false;
            inner.migrated = false;
            inner.lifecycle = LifecycleState::Closed;
        });
    }

    pub fn is_current(&self, epoch: u64) -> bool {
        self.with(|inner| inner.epoch == epoch && inner.lifecycle.is_open())
    }

    /// Applies a probe result. Returns `false` when the monitor's epoch is stale.
    pub fn record_probe(&self, epoch: u64, connected: bool) -> bool {
        self.with(|inner| {
            if inner.epoch != epoch || !inner.lifecycle.is_open() {
                return false;
            }
            inner.connected = connected;
            true
        })
    }
}
