//! Background tasks with graceful shutdown.
//!
//! The simulator runs long-lived loops (periodic channel snapshots, external
//! traffic drivers) alongside synchronous sends. [`ShutdownController`]
//! coordinates teardown: an `ArcSwap` run state for lock-free reads, a
//! `watch` channel to signal every loop, and RAII guards so
//! [`wait_for_drain`](ShutdownController::wait_for_drain) can block until
//! in-progress work finishes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::orchestrator::HierarchicalOrchestrator;

/// Lifecycle state of the background task set.
///
/// State machine: Starting -> Running -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Tasks have not been started yet.
    Starting,
    /// Tasks are running.
    Running,
    /// Shutdown was triggered; loops are exiting and work is draining.
    Draining,
    /// All tracked work completed after shutdown.
    Stopped,
}

/// Coordinates graceful shutdown across background loops.
///
/// 1. Loops subscribe via [`shutdown_receiver`](Self::shutdown_receiver)
/// 2. Each unit of work holds an [`in_flight_guard`](Self::in_flight_guard)
/// 3. [`trigger_shutdown`](Self::trigger_shutdown) flips to Draining and
///    signals every subscriber
/// 4. [`wait_for_drain`](Self::wait_for_drain) blocks until guards drop
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    run_state: Arc<ArcSwap<RunState>>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            run_state: Arc::new(ArcSwap::from_pointee(RunState::Starting)),
        }
    }

    /// Marks the task set as running.
    pub fn set_running(&self) {
        self.run_state.store(Arc::new(RunState::Running));
    }

    /// Returns a receiver notified when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Initiates shutdown: transitions to `Draining` and signals all loops.
    pub fn trigger_shutdown(&self) {
        self.run_state.store(Arc::new(RunState::Draining));
        // Ignore send errors: receivers may have been dropped already.
        let _ = self.shutdown_signal.send(true);
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn run_state(&self) -> RunState {
        **self.run_state.load()
    }

    /// Creates an RAII guard tracking one unit of in-flight work.
    ///
    /// The counter decrements when the guard drops, even on panic.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// The number of in-flight work units.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits until all in-flight work drains, up to `timeout`.
    ///
    /// Returns `true` (and transitions to `Stopped`) on a clean drain;
    /// `false` if the timeout expired with work still pending.
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

/// Spawns the periodic channel-snapshot loop.
///
/// Every `interval` the orchestrator captures a channel snapshot on the
/// blocking pool (the capture walks every node under its mutex). The loop
/// exits promptly when `controller` triggers shutdown; each capture holds an
/// in-flight guard so draining waits for a capture already underway.
pub fn spawn_snapshot_loop(
    orchestrator: Arc<HierarchicalOrchestrator>,
    interval: Duration,
    controller: &ShutdownController,
) -> JoinHandle<()> {
    let mut shutdown = controller.shutdown_receiver();
    let in_flight = Arc::clone(&controller.in_flight);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    in_flight.fetch_add(1, Ordering::Relaxed);
                    let orchestrator = Arc::clone(&orchestrator);
                    let capture = tokio::task::spawn_blocking(move || {
                        orchestrator.channel_snapshot();
                    })
                    .await;
                    in_flight.fetch_sub(1, Ordering::Relaxed);

                    if let Err(err) = capture {
                        tracing::warn!(%err, "snapshot capture task failed");
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!("snapshot loop shutting down");
                    break;
                }
            }
        }
    })
}
