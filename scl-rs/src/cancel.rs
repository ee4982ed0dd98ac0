//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is checked by the engine between children, on
//! every array element, and at each suspension point (I/O, delays).
//! Timeouts are the same signal fired by a timer task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Result, StructuredError};

/// Shared cancellation flag.  Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request cancellation.  Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StructuredError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any token clone, so this only returns
        // an error if every clone was dropped mid-wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Fire this token after `timeout`.  Must be called inside a tokio runtime.
    pub fn cancel_after(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::debug!(?timeout, "timeout elapsed, cancelling");
            token.cancel();
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
