//! Health report for external alerting.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Atomically updated counters describing agent health.
#[derive(Debug, Default)]
pub struct HealthReport {
    last_synced_block: AtomicU64,
    last_sync_at: AtomicU64,
    last_scheduler_pass_at: AtomicU64,
    rpc_errors: AtomicU64,
    liquidations_sent: AtomicU64,
    liquidations_confirmed: AtomicU64,
    fatal: Mutex<Option<String>>,
}

/// Point-in-time copy of [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub last_synced_block: u64,
    pub last_sync_at: u64,
    pub last_scheduler_pass_at: u64,
    pub rpc_errors: u64,
    pub liquidations_sent: u64,
    pub liquidations_confirmed: u64,
    pub fatal: Option<String>,
}

impl HealthReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sync(&self, block: u64, now: u64) {
        self.last_synced_block.fetch_max(block, Ordering::Relaxed);
        self.last_sync_at.store(now, Ordering::Relaxed);
    }

    pub fn record_scheduler_pass(&self, now: u64) {
        self.last_scheduler_pass_at.store(now, Ordering::Relaxed);
    }

    pub fn record_rpc_error(&self) {
        self.rpc_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_liquidation_sent(&self) {
        self.liquidations_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_liquidation_confirmed(&self) {
        self.liquidations_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal(&self, reason: impl Into<String>) {
        *self.fatal.lock() = Some(reason.into());
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            last_synced_block: self.last_synced_block.load(Ordering::Relaxed),
            last_sync_at: self.last_sync_at.load(Ordering::Relaxed),
            last_scheduler_pass_at: self.last_scheduler_pass_at.load(Ordering::Relaxed),
            rpc_errors: self.rpc_errors.load(Ordering::Relaxed),
            liquidations_sent: self.liquidations_sent.load(Ordering::Relaxed),
            liquidations_confirmed: self.liquidations_confirmed.load(Ordering::Relaxed),
            fatal: self.fatal.lock().clone(),
        }
    }

    /// Healthy when not fatal and sync ran within `max_staleness_secs`.
    pub fn is_healthy(&self, now: u64, max_staleness_secs: u64) -> bool {
        let snapshot = self.snapshot();
        snapshot.fatal.is_none()
            && snapshot.last_sync_at > 0
            && now.saturating_sub(snapshot.last_sync_at) <= max_staleness_secs
    }

    /// Log the current state; degraded state logs at warn.
    pub fn log(&self, now: u64, max_staleness_secs: u64) {
        let s = self.snapshot();
        if self.is_healthy(now, max_staleness_secs) {
            info!(
                block = s.last_synced_block,
                rpc_errors = s.rpc_errors,
                sent = s.liquidations_sent,
                confirmed = s.liquidations_confirmed,
                "Health"
            );
        } else {
            warn!(
                block = s.last_synced_block,
                sync_age = now.saturating_sub(s.last_sync_at),
                rpc_errors = s.rpc_errors,
                fatal = ?s.fatal,
                "Health degraded"
            );
        }
    }
}
