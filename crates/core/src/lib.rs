//! Sentinel core logic.
//!
//! This crate provides the agent itself:
//! - Chain sync engine with a durable, monotonic checkpoint
//! - Bounded, de-duplicating task queues with in-place retry
//! - Insolvency estimation in 256-bit integer arithmetic
//! - Priority tier resolution per token
//! - Liquidation scheduling, batching and transaction recovery
//! - Repository contract with an in-memory, snapshot-backed engine
//! - Configuration profiles, health reporting and notifications

pub mod config;
pub mod error;
pub mod estimation;
pub mod health;
pub mod int_math;
pub mod model;
pub mod notifier;
pub mod priority;
pub mod queue;
pub mod repository;
pub mod scheduler;
pub mod sentinel;
pub mod shutdown;
pub mod sync;
pub mod ticker;
pub mod transaction;

#[cfg(test)]
mod test_support;

pub use config::SentinelConfig;
pub use error::FatalError;
pub use estimation::{AgreementUpdater, EstimationEngine};
pub use health::{HealthReport, HealthSnapshot};
pub use model::{
    AccountEstimation, Agreement, AgreementTask, FlowDistribution, PriorityMode, SuperToken,
    SystemCheckpoint, Task, Threshold,
};
pub use notifier::{LogNotifier, Notifier, WebhookNotifier};
pub use priority::PriorityResolver;
pub use queue::{RetryPolicy, TaskHandler, TaskQueue};
pub use repository::{DueQuery, MemoryRepository, Repository, TokenFilter};
pub use scheduler::{PassReport, Scheduler};
pub use sentinel::Sentinel;
pub use shutdown::Shutdown;
pub use sync::{SyncEngine, SyncMode, SyncReport};
pub use ticker::Ticker;
pub use transaction::{TransactionEngine, TxJob, TxOutcome};

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
