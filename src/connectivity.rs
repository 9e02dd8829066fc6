//! Platform connectivity signal.
//!
//! Mirrors the host's online/offline flag. Transitions are published on a
//! watch channel so the recovery coordinator can react to reconnects.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared view of whether the platform reports network connectivity.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Report a platform online/offline event. Repeated reports of the same state are ignored.
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
            if online {
                tracing::info!("Platform reports connectivity restored");
            } else {
                tracing::warn!("Platform reports connectivity lost");
            }
        }
    }

    /// Receive connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
