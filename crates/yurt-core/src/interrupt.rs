//! Manual interruption shared by everything running in one session.
//!
//! An [`Interrupt`] is a latch: once triggered it stays triggered, and every
//! clone observes it. The binary arms one with [`Interrupt::on_ctrl_c`] at
//! startup and hands clones to the executor and the negotiator, so a Ctrl-C
//! ends a running command as well as the waits and probes in between.

use std::sync::Arc;
use tokio::sync::watch;

/// Shared, one-way interruption flag.
#[derive(Debug, Clone)]
pub struct Interrupt {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    /// Latch that only [`trigger`](Self::trigger) sets.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Latch set by the first Ctrl-C.
    ///
    /// Installs the process-wide signal handler, so call it once per session.
    /// Must be called from within a tokio runtime.
    pub fn on_ctrl_c() -> Self {
        let interrupt = Self::new();
        let listener = interrupt.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::warn!("Interrupt received, aborting");
                    listener.trigger();
                }
                Err(e) => tracing::debug!(error = %e, "Interrupt handler unavailable"),
            }
        });
        interrupt
    }

    /// Set the latch. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the latch has been set.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the latch is set, immediately if it already is.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = rx.wait_for(|set| *set).await;
    }
}
