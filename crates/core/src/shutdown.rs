//! Cooperative shutdown signal.
//!
//! Every retry loop checks [`Shutdown::is_triggered`] at its boundary and
//! long waits race [`Shutdown::cancelled`].

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::FatalError;

#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    fatal: Arc<Mutex<Option<FatalError>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// Request a graceful stop.
    pub fn trigger(&self) {
        if !self.is_triggered() {
            info!("Shutdown requested");
        }
        self.tx.send_replace(true);
    }

    /// Stop because of a fatal condition. The first reason wins.
    pub fn trigger_fatal(&self, reason: FatalError) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                error!(reason = %reason, "Fatal condition, shutting down");
                *fatal = Some(reason);
            }
        }
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// The recorded fatal reason, if any.
    pub fn fatal(&self) -> Option<FatalError> {
        self.fatal.lock().clone()
    }

    /// Resolves once shutdown is triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as self, so this only errs if it is dropped
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_fatal_reason_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        shutdown.trigger_fatal(FatalError::MissingSigner);
        shutdown.trigger_fatal(FatalError::ChainIdMismatch {
            expected: 1,
            actual: 5,
        });

        assert!(shutdown.is_triggered());
        assert_eq!(shutdown.fatal(), Some(FatalError::MissingSigner));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.cancelled().await })
        };

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.fatal().is_none());
    }
}
