//! Liveness monitor
//!
//! A background probe that runs `SELECT 1` against the shared handle every
//! interval (2 seconds by default) and maintains `ConnectionState.connected`.
//!
//! - Success sets `connected = true`.
//! - Failure is handed to the [`ErrorReporter`], sets `connected = false`, and
//!   the monitor keeps going.
//! - A handle that is no longer initialized sets `connected = false` and stops
//!   the monitor; the next `init()` starts a fresh one.
//! - A tick that finds the session in use (migration or transaction running)
//!   is skipped without touching the state, so probes never queue behind DDL.
//!
//! The monitor is a `may` coroutine. Only one tick is ever outstanding: it
//! waits on its stop channel for one interval, probes, then waits again.
//! Dropping or cancelling the [`MonitorHandle`] disconnects the channel and
//! wakes the coroutine at once.

use crate::connection::{ConnectionHandle, PROBE_QUERY};
use crate::executor::LifeExecutor;
use crate::reporter::ErrorReporter;
use crate::state::SharedState;
use crate::config::MIN_PROBE_INTERVAL;
use may::coroutine::{Builder, JoinHandle};
use may::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Result of a single liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probe succeeded, `connected = true`
    Alive,
    /// Probe failed and was reported, `connected = false`
    Failed,
    /// Handle torn down, `connected = false`, monitor stops
    NotInitialized,
    /// Session in use, tick skipped
    Busy,
    /// Monitor outlived its epoch (closed), nothing written
    Cancelled,
}

impl ProbeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeOutcome::Alive => "alive",
            ProbeOutcome::Failed => "failed",
            ProbeOutcome::NotInitialized => "not_initialized",
            ProbeOutcome::Busy => "busy",
            ProbeOutcome::Cancelled => "cancelled",
        }
    }

    fn stops_monitor(self) -> bool {
        matches!(self, ProbeOutcome::NotInitialized | ProbeOutcome::Cancelled)
    }
}

/// Runs one probe against `handle` on behalf of a monitor started in `epoch`.
pub fn probe_once(
    handle: &ConnectionHandle,
    state: &SharedState,
    reporter: &dyn ErrorReporter,
    epoch: u64,
) -> ProbeOutcome {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::probe_span().entered();

    let outcome = probe(handle, state, reporter, epoch);

    #[cfg(feature = "metrics")]
    METRICS.record_probe(outcome.as_str());

    outcome
}

fn probe(
    handle: &ConnectionHandle,
    state: &SharedState,
    reporter: &dyn ErrorReporter,
    epoch: u64,
) -> ProbeOutcome {
    if !state.is_current(epoch) {
        return ProbeOutcome::Cancelled;
    }

    if !handle.is_initialized() {
        state.record_probe(epoch, false);
        return ProbeOutcome::NotInitialized;
    }

    let session = match handle.try_session() {
        Ok(Some(session)) => session,
        Ok(None) => return ProbeOutcome::Busy,
        Err(_) => {
            state.record_probe(epoch, false);
            return ProbeOutcome::NotInitialized;
        }
    };
    let result = session.execute(PROBE_QUERY, &[]);
    drop(session);

    match result {
        Ok(_) => {
            if state.record_probe(epoch, true) {
                ProbeOutcome::Alive
            } else {
                ProbeOutcome::Cancelled
            }
        }
        Err(e) => {
            reporter.report(&e);
            state.record_probe(epoch, false);
            ProbeOutcome::Failed
        }
    }
}

/// Background liveness probe for one connection handle.
pub struct LivenessMonitor {
    handle: Arc<ConnectionHandle>,
    state: Arc<SharedState>,
    reporter: Arc<dyn ErrorReporter>,
    interval: Duration,
    epoch: u64,
}

impl LivenessMonitor {
    pub fn new(
        handle: Arc<ConnectionHandle>,
        state: Arc<SharedState>,
        reporter: Arc<dyn ErrorReporter>,
        interval: Duration,
        epoch: u64,
    ) -> Self {
        Self {
            handle,
            state,
            reporter,
            interval: interval.max(MIN_PROBE_INTERVAL),
            epoch,
        }
    }

    /// Starts the monitor as a named `may` coroutine.
    ///
    /// # Errors
    ///
    /// Returns the error from the coroutine builder if it cannot be spawned.
    pub fn spawn(self) -> io::Result<MonitorHandle> {
        let (stop_tx, stop_rx) = channel::<()>();
        let builder = Builder::new().name("lifebuoy-liveness".to_string());
        let coroutine = may::go!(builder, move || self.run(stop_rx))?;

        Ok(MonitorHandle {
            stop: Some(stop_tx),
            coroutine: Some(coroutine),
        })
    }

    fn run(self, stop: Receiver<()>) {
        log::debug!("Liveness monitor started, probing every {:?}", self.interval);

        loop {
            match stop.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            let outcome = probe_once(&self.handle, &self.state, self.reporter.as_ref(), self.epoch);
            if outcome.stops_monitor() {
                log::debug!("Liveness monitor stopping after {} probe", outcome.as_str());
                break;
            }
        }

        log::debug!("Liveness monitor stopped");
    }
}

/// Owner's side of a running [`LivenessMonitor`]; the cancellation token.
pub struct MonitorHandle {
    stop: Option<Sender<()>>,
    coroutine: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stops the monitor before its next probe. Does not wait.
    pub fn cancel(&mut self) {
        // Disconnecting the channel wakes the waiting monitor
        self.stop.take();
    }

    pub fn is_running(&self) -> bool {
        self.coroutine.as_ref().is_some_and(|co| !co.is_done())
    }

    /// Cancels and waits for a probe that is already executing to finish.
    pub fn join(mut self) {
        self.cancel();
        if let Some(co) = self.coroutine.take() {
            if co.join().is_err() {
                log::warn!("Liveness monitor coroutine panicked");
            }
        }
    }
}

impl fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("cancelled", &self.stop.is_none())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::connection::ConnectionOptions;
    use crate::reporter::ChannelReporter;
    use crate::test_helpers::{wait_until, FakeExecutor};
    use std::thread;

    struct Fixture {
        fake: FakeExecutor,
        handle: Arc<ConnectionHandle>,
        state: Arc<SharedState>,
        reporter: Arc<ChannelReporter>,
        reports: crossbeam_channel::Receiver<String>,
        epoch: u64,
    }

    fn fixture() -> Fixture {
        let fake = FakeExecutor::new();
        let options = ConnectionOptions::from_config(&DatabaseConfig::default(), Vec::new());
        let handle = Arc::new(ConnectionHandle::new(Box::new(fake.clone()), options));
        let state = Arc::new(SharedState::new());
        let epoch = state.mark_connected();
        let (tx, reports) = crossbeam_channel::unbounded();
        Fixture {
            fake,
            handle,
            state,
            reporter: Arc::new(ChannelReporter::new(tx)),
            reports,
            epoch,
        }
    }

    impl Fixture {
        fn probe(&self) -> ProbeOutcome {
            probe_once(&self.handle, &self.state, self.reporter.as_ref(), self.epoch)
        }

        fn monitor(&self, interval_ms: u64) -> MonitorHandle {
            LivenessMonitor::new(
                Arc::clone(&self.handle),
                Arc::clone(&self.state),
                self.reporter.clone(),
                Duration::from_millis(interval_ms),
                self.epoch,
            )
            .spawn()
            .unwrap()
        }
    }

    #[test]
    fn test_successful_probe_marks_connected() {
        let f = fixture();
        f.state.record_probe(f.epoch, false);

        assert_eq!(f.probe(), ProbeOutcome::Alive);
        assert!(f.state.snapshot().connected);
        assert_eq!(f.fake.count(PROBE_QUERY), 1);
    }

    #[test]
    fn test_failed_probe_is_reported_and_marks_disconnected() {
        let f = fixture();
        f.fake.fail_on(PROBE_QUERY);

        assert_eq!(f.probe(), ProbeOutcome::Failed);
        assert!(!f.state.snapshot().connected);
        assert!(f.reports.try_recv().unwrap().contains(PROBE_QUERY));
    }

    #[test]
    fn test_destroyed_handle_marks_disconnected() {
        let f = fixture();
        f.handle.destroy();

        assert_eq!(f.probe(), ProbeOutcome::NotInitialized);
        assert!(!f.state.snapshot().connected);
        assert_eq!(f.fake.count(PROBE_QUERY), 0);
    }

    #[test]
    fn test_busy_session_skips_tick() {
        let f = fixture();
        let held = f.handle.session().unwrap();

        assert_eq!(f.probe(), ProbeOutcome::Busy);
        assert!(f.state.snapshot().connected);
        drop(held);
        assert_eq!(f.fake.count(PROBE_QUERY), 0);
    }

    #[test]
    fn test_stale_epoch_is_cancelled() {
        let f = fixture();
        f.state.mark_closed();

        assert_eq!(f.probe(), ProbeOutcome::Cancelled);
        assert_eq!(f.fake.count(PROBE_QUERY), 0);
    }

    #[test]
    fn test_monitor_reschedules_and_stops_on_join() {
        let f = fixture();
        let monitor = f.monitor(5);

        assert!(wait_until(Duration::from_secs(5), || f.fake.count(PROBE_QUERY) >= 3));
        monitor.join();

        let probes = f.fake.count(PROBE_QUERY);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(f.fake.count(PROBE_QUERY), probes);
    }

    #[test]
    fn test_monitor_survives_failures() {
        let f = fixture();
        f.fake.fail_on(PROBE_QUERY);
        let monitor = f.monitor(5);

        assert!(wait_until(Duration::from_secs(5), || f.reports.len() >= 3));
        assert!(monitor.is_running());
        assert!(!f.state.snapshot().connected);

        f.fake.clear_failures();
        assert!(wait_until(Duration::from_secs(5), || f.state.snapshot().connected));
        monitor.join();
    }

    #[test]
    fn test_monitor_stops_itself_when_handle_destroyed() {
        let f = fixture();
        let monitor = f.monitor(5);
        f.handle.destroy();

        assert!(wait_until(Duration::from_secs(5), || !monitor.is_running()));
        assert!(!f.state.snapshot().connected);
    }

    #[test]
    fn test_zero_interval_is_raised_to_minimum() {
        let f = fixture();
        let monitor = f.monitor(0);

        thread::sleep(Duration::from_millis(50));
        monitor.join();
        // At most one probe per millisecond
        assert!(f.fake.count(PROBE_QUERY) < 500);
    }
}
