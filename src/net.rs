//! Connectivity signal fan-out.
//!
//! The platform layer feeds connectivity transitions into a
//! [`ConnectivityMonitor`]; every interested component (token manager,
//! auth facade, sync engine) holds a clone and subscribes to transitions.
//! The monitor itself never probes the network.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Shared connectivity flag. Clone is cheap; all clones observe the same
/// underlying channel.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    /// Record a connectivity transition reported by the platform.
    /// Subscribers are only notified when the value actually changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            debug!(online, "connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to connectivity transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
