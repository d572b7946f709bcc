//! Configuration.
//!
//! - Runtime configuration with profiles (sync, queues, liquidation, gas,
//!   priority, tokens, persistence, notifications)
//! - Network endpoints and contract addresses with `${VAR}` expansion

mod network;
mod sentinel;

pub use network::{ContractsConfig, NetworkConfig};
pub use sentinel::{
    GasConfig, GasPricingModel, LiquidationConfig, NotificationConfig, PersistenceConfig,
    PriorityConfig, QueueConfig, SentinelConfig, SyncConfig, ThresholdConfig, TokensConfig,
};
