//! Online/offline detection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Last known reachability of the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn from_reachable(reachable: bool) -> Self {
        if reachable {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        *self == ConnectivityState::Online
    }
}

/// Point-in-time view captured once per repository call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
    pub reachable: bool,
}

/// Source of connectivity snapshots.
///
/// `snapshot` never blocks. `report_unreachable` is how callers that observed
/// a transient remote failure push the state to offline.
pub trait ConnectivityProvider: Send + Sync {
    fn snapshot(&self) -> ConnectivitySnapshot;

    fn report_unreachable(&self);
}

/// Connectivity state shared through a `watch` channel.
///
/// Cheap to clone. Subscribers are woken only on transitions.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    /// Record the latest reachability; returns whether the state changed.
    pub fn set_reachable(&self, reachable: bool) -> bool {
        let next = ConnectivityState::from_reachable(reachable);
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!(state = ?next, "connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Invoke `callback` on every transition until the monitor is dropped.
    pub fn on_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                callback(state);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Offline)
    }
}

impl ConnectivityProvider for ConnectivityMonitor {
    fn snapshot(&self) -> ConnectivitySnapshot {
        ConnectivitySnapshot {
            reachable: self.state().is_online(),
        }
    }

    fn report_unreachable(&self) {
        self.set_reachable(false);
    }
}

/// Provider that always answers the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedConnectivity(pub bool);

impl FixedConnectivity {
    pub const ONLINE: Self = FixedConnectivity(true);
    pub const OFFLINE: Self = FixedConnectivity(false);
}

impl ConnectivityProvider for FixedConnectivity {
    fn snapshot(&self) -> ConnectivitySnapshot {
        ConnectivitySnapshot { reachable: self.0 }
    }

    fn report_unreachable(&self) {}
}

/// Polls `{api_url}/health` and feeds the monitor.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    monitor: ConnectivityMonitor,
}

impl HealthProbe {
    pub fn new(api_url: &str, interval: Duration, timeout: Duration, monitor: ConnectivityMonitor) -> Self {
        // A client that cannot be configured probes with defaults instead.
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: format!("{}/health", api_url.trim_end_matches('/')),
            interval,
            monitor,
        }
    }

    /// Probe once; any failure counts as offline.
    pub async fn check_once(&self) -> bool {
        let reachable = match self.client.get(&self.url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(error = %err, "health probe failed");
                false
            }
        };
        self.monitor.set_reachable(reachable);
        reachable
    }

    /// Probe forever at the configured interval.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn snapshot_reflects_latest_state() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online);
        assert!(monitor.snapshot().reachable);

        monitor.report_unreachable();
        assert!(!monitor.snapshot().reachable);
        assert!(!monitor.set_reachable(false));
    }

    #[tokio::test]
    async fn callbacks_fire_on_transitions_only() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Offline);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut rx = monitor.subscribe();
        let handle = monitor.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.set_reachable(false);
        monitor.set_reachable(true);
        rx.changed().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn failed_probe_marks_offline() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online);
        let probe = HealthProbe::new(
            "http://127.0.0.1:9",
            Duration::from_secs(60),
            Duration::from_millis(200),
            monitor.clone(),
        );

        assert!(!probe.check_once().await);
        assert_eq!(monitor.state(), ConnectivityState::Offline);
    }
}
