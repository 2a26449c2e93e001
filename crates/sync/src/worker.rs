//! Background worker turning triggers into sync sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::error::SyncError;
use crate::orchestrator::SyncOrchestrator;
use crate::types::{SyncOutcome, SyncTrigger};

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Background sync worker.
///
/// Listens for reconnects, periodic ticks, app-foreground signals and
/// post-write nudges. Background sessions are skipped while one is running.
pub struct SyncWorker {
    orchestrator: SyncOrchestrator,
    monitor: ConnectivityMonitor,
    interval: Duration,
    nudge: Arc<Notify>,
    foreground: Arc<Notify>,
    shutdown: Arc<Notify>,
}

/// Handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    task: JoinHandle<()>,
    foreground: Arc<Notify>,
    shutdown: Arc<Notify>,
}

impl WorkerHandle {
    /// The app came to the foreground.
    pub fn notify_foreground(&self) {
        self.foreground.notify_one();
    }

    /// Stop the worker and wait for it to finish its current session.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "sync worker task failed");
        }
    }
}

impl SyncWorker {
    pub fn new(orchestrator: SyncOrchestrator, monitor: ConnectivityMonitor, interval: Duration, nudge: Arc<Notify>) -> Self {
        Self {
            orchestrator,
            monitor,
            interval,
            nudge,
            foreground: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn start(self) -> WorkerHandle {
        let foreground = Arc::clone(&self.foreground);
        let shutdown = Arc::clone(&self.shutdown);
        let task = tokio::spawn(self.run());
        WorkerHandle {
            task,
            foreground,
            shutdown,
        }
    }

    async fn run(self) {
        tracing::info!(interval_secs = self.interval.as_secs(), "background sync worker started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; consume it so startup does not double-sync.
        ticker.tick().await;

        let mut connectivity = self.monitor.subscribe();
        let mut last_state = *connectivity.borrow_and_update();
        let mut backoff = Backoff::default();

        loop {
            let trigger = tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("background sync worker received shutdown signal");
                    break;
                }
                Ok(()) = connectivity.changed() => {
                    let state = *connectivity.borrow_and_update();
                    let reconnected = last_state == ConnectivityState::Offline && state == ConnectivityState::Online;
                    last_state = state;
                    if !reconnected {
                        continue;
                    }
                    SyncTrigger::Reconnect
                }
                _ = self.foreground.notified() => SyncTrigger::Foreground,
                _ = ticker.tick() => SyncTrigger::Periodic,
                _ = self.nudge.notified() => SyncTrigger::AfterWrite,
            };

            if backoff.holds(trigger) {
                tracing::debug!(trigger = trigger.as_str(), "in failure backoff, skipping trigger");
                continue;
            }

            match self.orchestrator.run(trigger).await {
                Ok(SyncOutcome::Completed(session)) => {
                    if session.interrupted {
                        backoff.failed();
                    } else {
                        backoff.reset();
                    }
                }
                Ok(SyncOutcome::Skipped) => {}
                Err(SyncError::Offline) => {
                    tracing::debug!(trigger = trigger.as_str(), "offline, skipping sync");
                }
                Err(err) => {
                    backoff.failed();
                    tracing::error!(
                        trigger = trigger.as_str(),
                        failures = backoff.failures,
                        error = %err,
                        "background sync failed"
                    );
                }
            }
        }

        tracing::info!("background sync worker stopped");
    }
}

/// Exponential backoff after failed sessions, capped at five minutes.
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    until: Option<Instant>,
}

impl Backoff {
    fn delay(failures: u32) -> Duration {
        std::cmp::min(Duration::from_secs(1) * (1 << failures.min(8)), MAX_BACKOFF)
    }

    fn failed(&mut self) {
        self.failures += 1;
        self.until = Some(Instant::now() + Self::delay(self.failures));
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.until = None;
    }

    /// Automatic triggers wait out the backoff; user-facing ones do not.
    fn holds(&self, trigger: SyncTrigger) -> bool {
        match trigger {
            SyncTrigger::Periodic | SyncTrigger::AfterWrite => self.until.is_some_and(|until| Instant::now() < until),
            _ => false,
        }
    }
}
