//! Graceful shutdown controller for the control plane.
//!
//! Uses `ArcSwap` for lock-free run-state transitions and an atomic counter
//! with RAII guards to track in-flight operations. The four background
//! workers (flush, scheduler, lease sweeper, metrics sampler) select on the
//! shutdown receiver alongside their tick loops; facade operations,
//! scheduler reconcile cycles, and spawned outbound builds hold in-flight
//! guards, which `wait_for_drain` waits out after the workers exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Control-plane run state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Stores are opening and state is being hydrated.
    Starting,
    /// Workers are running and operations are accepted.
    Running,
    /// Shutdown signalled; waiting for in-flight operations to finish.
    Draining,
    /// All in-flight operations completed.
    Stopped,
}

/// Coordinates graceful shutdown across the control plane:
///
/// 1. Workers subscribe via `shutdown_receiver()` and exit when signalled
/// 2. `trigger_shutdown()` moves to Draining and notifies all receivers
/// 3. `wait_for_drain()` blocks until in-flight operations complete
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    run_state: Arc<ArcSwap<RunState>>,
}

impl ShutdownController {
    /// Creates a new controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            run_state: Arc::new(ArcSwap::from_pointee(RunState::Starting)),
        }
    }

    /// Transitions to `Running` once boot completes.
    pub fn set_running(&self) {
        self.run_state.store(Arc::new(RunState::Running));
    }

    /// Returns a receiver notified when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Whether shutdown has been triggered.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_signal.borrow()
    }

    /// Initiates graceful shutdown: transitions to `Draining` and signals
    /// every receiver.
    pub fn trigger_shutdown(&self) {
        self.run_state.store(Arc::new(RunState::Draining));
        // Ignore send errors -- receivers may have been dropped
        let _ = self.shutdown_signal.send(true);
    }

    /// Returns the current run state.
    #[must_use]
    pub fn run_state(&self) -> RunState {
        **self.run_state.load()
    }

    /// Creates an RAII guard tracking one in-flight operation.
    ///
    /// The counter is decremented when the guard drops, even on panic.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Current number of in-flight operations.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for in-flight operations to complete, up to `timeout`.
    ///
    /// Returns `true` on a clean drain (state becomes `Stopped`), `false`
    /// if the timeout expired (state stays `Draining`).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.run_state.store(Arc::new(RunState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
