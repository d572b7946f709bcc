//! Cancellable periodic task.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::shutdown::Shutdown;

/// Runs a tick function on a fixed period until stopped or shut down.
///
/// A tick is never interrupted; stop takes effect at the next boundary.
/// Ticks that overrun the period are delayed rather than bunched.
pub struct Ticker {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Spawn the ticker. The first tick fires immediately.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, shutdown: Shutdown, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(ticker = name, period = ?period, "Ticker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                    _ = shutdown.cancelled() => break,
                }
                if *stop_rx.borrow() || shutdown.is_triggered() {
                    break;
                }
                tick().await;
            }

            debug!(ticker = name, "Ticker stopped");
        });

        Self {
            name,
            stop_tx,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Ask the ticker to stop after the current tick.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Wait for the ticker task to exit.
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let count = count.clone();
            Ticker::spawn("test", Duration::from_secs(10), Shutdown::new(), move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        // Immediate tick plus three periods
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);

        ticker.stop();
        ticker.join().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_ticker() {
        let shutdown = Shutdown::new();
        let ticker = Ticker::spawn("test", Duration::from_secs(1), shutdown.clone(), || async {});

        shutdown.trigger();
        ticker.join().await;
    }
}
