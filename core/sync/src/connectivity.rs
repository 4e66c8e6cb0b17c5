//! Online/offline tracking.
//!
//! The engine never reads a global network flag. It asks a
//! [`ConnectivityMonitor`], which the host wires to its own signal; tests
//! inject a [`ManualConnectivity`] and flip it by hand.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(&self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connectivity::Online => f.write_str("online"),
            Connectivity::Offline => f.write_str("offline"),
        }
    }
}

/// Source of connectivity state.
pub trait ConnectivityMonitor: Send + Sync {
    /// Current state.
    fn current(&self) -> Connectivity;

    /// Watch transitions. The receiver starts at the current state.
    fn subscribe(&self) -> watch::Receiver<Connectivity>;

    fn is_online(&self) -> bool {
        self.current().is_online()
    }
}

/// Connectivity set explicitly by the host, or by a test.
pub struct ManualConnectivity {
    state: watch::Sender<Connectivity>,
}

impl ManualConnectivity {
    pub fn new(initial: Connectivity) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    pub fn online() -> Self {
        Self::new(Connectivity::Online)
    }

    pub fn offline() -> Self {
        Self::new(Connectivity::Offline)
    }

    /// Update the state. Returns whether it changed.
    ///
    /// Subscribers are only notified on an actual transition.
    pub fn set(&self, state: Connectivity) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(%state, "Connectivity changed");
        }
        changed
    }

    pub fn go_online(&self) -> bool {
        self.set(Connectivity::Online)
    }

    pub fn go_offline(&self) -> bool {
        self.set(Connectivity::Offline)
    }
}

impl ConnectivityMonitor for ManualConnectivity {
    fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }
}

/// Connectivity derived from periodically opening a TCP connection to a
/// reference address (usually the sync endpoint itself).
pub struct ProbeConnectivity {
    state: std::sync::Arc<ManualConnectivity>,
    task: JoinHandle<()>,
}

impl ProbeConnectivity {
    /// Start probing `addr` every `interval`; a probe that does not connect
    /// within `timeout` counts as offline.
    ///
    /// Must be called from within a tokio runtime. The initial state is
    /// offline until the first probe succeeds.
    pub fn spawn(addr: SocketAddr, interval: Duration, timeout: Duration) -> Self {
        let state = std::sync::Arc::new(ManualConnectivity::offline());
        let probe_state = state.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reachable = matches!(
                    tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
                    Ok(Ok(_))
                );
                debug!(%addr, reachable, "Connectivity probe");
                probe_state.set(reachable.into());
            }
        });

        Self { state, task }
    }
}

impl ConnectivityMonitor for ProbeConnectivity {
    fn current(&self) -> Connectivity {
        self.state.current()
    }

    fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }
}

impl Drop for ProbeConnectivity {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_manual_transitions() {
        let monitor = ManualConnectivity::online();
        assert!(monitor.is_online());

        assert!(monitor.go_offline());
        assert!(!monitor.go_offline());
        assert_eq!(monitor.current(), Connectivity::Offline);

        assert!(monitor.go_online());
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = ManualConnectivity::offline();
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow_and_update(), Connectivity::Offline);

        monitor.go_online();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Connectivity::Online);
    }

    #[tokio::test]
    async fn test_redundant_set_does_not_notify() {
        let monitor = ManualConnectivity::online();
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        monitor.go_online();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_probe_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe =
            ProbeConnectivity::spawn(addr, Duration::from_millis(20), Duration::from_secs(1));
        let mut rx = probe.subscribe();

        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.is_online()))
            .await
            .unwrap()
            .unwrap();
        assert!(probe.is_online());
    }
}
