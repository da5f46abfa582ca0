//! Shutdown readiness flag owned by the collaborator
//!
//! The collaborator marks itself busy while it processes messages and ready
//! once drained. `ConnectionSupervisor::shutdown` waits for ready.

use std::sync::Arc;
use tokio::sync::watch;

/// Clonable handle to one readiness flag. Ready by default.
#[derive(Debug, Clone)]
pub struct ShutdownReadiness {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownReadiness {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ShutdownReadiness {
    pub fn new(ready: bool) -> Self {
        let (tx, _) = watch::channel(ready);
        Self { tx: Arc::new(tx) }
    }

    pub fn set_ready(&self, ready: bool) {
        self.tx.send_replace(ready);
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set
    pub async fn wait_ready(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|ready| *ready).await;
    }
}
