//! Runtime configuration with profile support.
//!
//! Every field has a serde default so a TOML file only needs the values it
//! changes. Profiles (`default`, `testing`, `production`) are selected with
//! `SENTINEL_PROFILE` when no file is given through `SENTINEL_CONFIG`.

use alloy::primitives::{Address, I256};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::network::{expand_env, NetworkConfig};
use crate::int_math::{gwei_to_wei, multiplier_to_bps};
use crate::model::Threshold;
use crate::queue::RetryPolicy;
use crate::repository::TokenFilter;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Profile name (for logging/identification)
    #[serde(default = "default_profile_name")]
    pub profile: String,

    #[serde(default)]
    pub network: NetworkConfig,

    /// Chain log scanning
    #[serde(default)]
    pub sync: SyncConfig,

    /// Task queue sizing and retries
    #[serde(default)]
    pub queue: QueueConfig,

    /// Scheduler and execution
    #[serde(default)]
    pub liquidation: LiquidationConfig,

    #[serde(default)]
    pub gas: GasConfig,

    /// Priority-bond tier resolution
    #[serde(default)]
    pub priority: PriorityConfig,

    /// Token include/exclude lists and thresholds
    #[serde(default)]
    pub tokens: TokensConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

fn default_profile_name() -> String {
    "default".to_string()
}

/// Chain log scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// First block the protocol emitted events at
    #[serde(default)]
    pub epoch_block: u64,

    /// Widest `eth_getLogs` window
    #[serde(default = "default_max_query_block_range")]
    pub max_query_block_range: u64,

    /// Confirmations to stay behind head
    #[serde(default = "default_block_offset")]
    pub block_offset: u64,

    /// Live sync interval (seconds)
    #[serde(default = "default_live_interval")]
    pub live_interval_secs: u64,

    /// Health log interval (seconds)
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

fn default_max_query_block_range() -> u64 {
    2_000
}
fn default_block_offset() -> u64 {
    12
}
fn default_live_interval() -> u64 {
    30
}
fn default_health_interval() -> u64 {
    60
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            epoch_block: 0,
            max_query_block_range: default_max_query_block_range(),
            block_offset: default_block_offset(),
            live_interval_secs: default_live_interval(),
            health_interval_secs: default_health_interval(),
        }
    }
}

impl SyncConfig {
    pub fn live_interval(&self) -> Duration {
        Duration::from_secs(self.live_interval_secs)
    }
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

/// Task queue sizing and retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Workers per queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retries before a task is fatal
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Linear backoff step (milliseconds)
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_concurrency() -> usize {
    4
}
fn default_retry_budget() -> u32 {
    10
}
fn default_retry_delay() -> u64 {
    1_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry_budget: default_retry_budget(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            budget: self.retry_budget,
            base_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

/// Scheduler and execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationConfig {
    /// Track and estimate but never send transactions
    #[serde(default)]
    pub observer: bool,

    /// Scheduler interval (seconds)
    #[serde(default = "default_liquidation_interval")]
    pub interval_secs: u64,

    /// Flows per batch call
    #[serde(default = "default_max_batch_tx")]
    pub max_batch_tx: usize,

    /// Candidates per scheduler pass
    #[serde(default)]
    pub max_candidates: Option<usize>,

    /// Apply per-token minimum flow rates
    #[serde(default)]
    pub use_thresholds: bool,

    /// Wait for a receipt this long before bumping (seconds)
    #[serde(default = "default_broadcast_timeout")]
    pub broadcast_timeout_secs: u64,
}

fn default_liquidation_interval() -> u64 {
    30
}
fn default_max_batch_tx() -> usize {
    10
}
fn default_broadcast_timeout() -> u64 {
    60
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            observer: false,
            interval_secs: default_liquidation_interval(),
            max_batch_tx: default_max_batch_tx(),
            max_candidates: None,
            use_thresholds: false,
            broadcast_timeout_secs: default_broadcast_timeout(),
        }
    }
}

impl LiquidationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_secs(self.broadcast_timeout_secs)
    }
}

/// Gas pricing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GasPricingModel {
    /// Legacy gas pricing (gas price only)
    #[default]
    Legacy,
    /// EIP-1559 (base fee + priority fee)
    Eip1559,
}

impl GasPricingModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "Legacy",
            Self::Eip1559 => "Eip1559",
        }
    }
}

/// Gas pricing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasConfig {
    #[serde(default)]
    pub pricing: GasPricingModel,

    /// Fallback when the node cannot quote a price (gwei)
    #[serde(default = "default_gas_price")]
    pub default_gas_price_gwei: f64,

    /// Hard cap (gwei)
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price_gwei: f64,

    /// Price multiplier per retry (e.g. 1.15)
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
}

fn default_gas_price() -> f64 {
    1.0
}
fn default_max_gas_price() -> f64 {
    500.0
}
fn default_retry_multiplier() -> f64 {
    1.15
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            pricing: GasPricingModel::default(),
            default_gas_price_gwei: default_gas_price(),
            max_gas_price_gwei: default_max_gas_price(),
            retry_multiplier: default_retry_multiplier(),
        }
    }
}

impl GasConfig {
    pub fn default_gas_price_wei(&self) -> u128 {
        gwei_to_wei(self.default_gas_price_gwei)
    }
    pub fn max_gas_price_wei(&self) -> u128 {
        gwei_to_wei(self.max_gas_price_gwei)
    }
    pub fn retry_multiplier_bps(&self) -> u32 {
        multiplier_to_bps(self.retry_multiplier)
    }
}

/// Priority-bond tier resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityConfig {
    /// Address this agent liquidates with priority as (bond holder or reward address)
    #[serde(default)]
    pub address: Option<Address>,

    /// Extra seconds added to the patrician period when not privileged
    #[serde(default)]
    pub additional_delay_secs: u64,
}

/// Per-token minimum flow rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub token: Address,
    /// Absolute flow rate (wei/second); TOML integers are 64-bit
    pub minimum_flow_rate: i64,
}

/// Token include/exclude lists and thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokensConfig {
    /// Only these tokens, when non-empty
    #[serde(default)]
    pub include: Vec<Address>,
    #[serde(default)]
    pub exclude: Vec<Address>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdConfig>,
}

impl TokensConfig {
    pub fn filter(&self) -> TokenFilter {
        TokenFilter {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        }
    }

    pub fn thresholds(&self) -> Vec<Threshold> {
        self.thresholds
            .iter()
            .map(|t| Threshold {
                token: t.token,
                minimum_flow_rate: I256::try_from(t.minimum_flow_rate).unwrap_or(I256::ZERO),
            })
            .collect()
    }
}

/// Repository persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON snapshot file; `None` keeps state in memory only
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: Option<String>,
}

fn default_snapshot_path() -> Option<String> {
    Some("sentinel-state.json".to_string())
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

/// Operator notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Webhook URL (`${VAR}` allowed); log-only when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_notify_timeout")]
    pub timeout_secs: u64,
}

fn default_notify_timeout() -> u64 {
    10
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notify_timeout(),
        }
    }
}

impl NotificationConfig {
    pub fn webhook_url(&self) -> Option<String> {
        self.webhook_url
            .as_deref()
            .map(expand_env)
            .filter(|u| !u.is_empty() && !u.contains("${"))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            network: NetworkConfig::default(),
            sync: SyncConfig::default(),
            queue: QueueConfig::default(),
            liquidation: LiquidationConfig::default(),
            gas: GasConfig::default(),
            priority: PriorityConfig::default(),
            tokens: TokensConfig::default(),
            persistence: PersistenceConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl SentinelConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing config {path}"))?;
        Ok(config)
    }

    /// Short intervals and small windows for testnets.
    pub fn testing() -> Self {
        Self {
            profile: "testing".to_string(),
            sync: SyncConfig {
                max_query_block_range: 500,
                block_offset: 2,
                live_interval_secs: 10,
                health_interval_secs: 30,
                ..SyncConfig::default()
            },
            queue: QueueConfig {
                concurrency: 2,
                retry_budget: 5,
                retry_delay_ms: 500,
            },
            liquidation: LiquidationConfig {
                interval_secs: 10,
                max_batch_tx: 5,
                broadcast_timeout_secs: 30,
                ..LiquidationConfig::default()
            },
            gas: GasConfig {
                max_gas_price_gwei: 50.0,
                retry_multiplier: 1.2,
                ..GasConfig::default()
            },
            persistence: PersistenceConfig {
                snapshot_path: None,
            },
            ..Self::default()
        }
    }

    /// Conservative settings for mainnets.
    pub fn production() -> Self {
        Self {
            profile: "production".to_string(),
            sync: SyncConfig {
                max_query_block_range: 5_000,
                block_offset: 12,
                live_interval_secs: 30,
                ..SyncConfig::default()
            },
            queue: QueueConfig {
                concurrency: 8,
                retry_budget: 15,
                retry_delay_ms: 2_000,
            },
            liquidation: LiquidationConfig {
                interval_secs: 15,
                max_batch_tx: 10,
                broadcast_timeout_secs: 90,
                use_thresholds: true,
                ..LiquidationConfig::default()
            },
            ..Self::default()
        }
    }

    /// Profile named by `SENTINEL_PROFILE`, or default.
    /// Supported values: testing, production
    pub fn from_profile_env() -> Self {
        let profile = std::env::var("SENTINEL_PROFILE").unwrap_or_else(|_| "default".to_string());
        match profile.to_lowercase().as_str() {
            "testing" | "test" => Self::testing(),
            "production" | "prod" => Self::production(),
            _ => Self::default(),
        }
    }

    /// `SENTINEL_CONFIG` file if set, else the profile; then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("SENTINEL_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::from_profile_env(),
        };
        config.network.expand_env_vars();
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OBSERVER") {
            self.liquidation.observer = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(address) = std::env::var("PRIORITY_ADDRESS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.priority.address = Some(address);
        }
        if let Ok(url) = std::env::var("WEBHOOK_URL") {
            self.notifications.webhook_url = Some(url);
        }
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        tracing::info!(profile = %self.profile, "Sentinel configuration loaded");
        tracing::info!(
            epoch_block = self.sync.epoch_block,
            max_range = self.sync.max_query_block_range,
            block_offset = self.sync.block_offset,
            live_interval = self.sync.live_interval_secs,
            "Sync"
        );
        tracing::info!(
            concurrency = self.queue.concurrency,
            retry_budget = self.queue.retry_budget,
            retry_delay_ms = self.queue.retry_delay_ms,
            "Queues"
        );
        tracing::info!(
            observer = self.liquidation.observer,
            interval = self.liquidation.interval_secs,
            max_batch_tx = self.liquidation.max_batch_tx,
            broadcast_timeout = self.liquidation.broadcast_timeout_secs,
            use_thresholds = self.liquidation.use_thresholds,
            "Liquidation"
        );
        tracing::info!(
            pricing = self.gas.pricing.as_str(),
            max_gwei = self.gas.max_gas_price_gwei,
            retry_multiplier = self.gas.retry_multiplier,
            "Gas"
        );
        tracing::info!(
            priority_address = ?self.priority.address,
            additional_delay = self.priority.additional_delay_secs,
            include = self.tokens.include.len(),
            exclude = self.tokens.exclude.len(),
            "Priority and tokens"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SentinelConfig::default();
        assert_eq!(config.sync.max_query_block_range, 2_000);
        assert_eq!(config.gas.max_gas_price_wei(), 500_000_000_000);
        assert_eq!(config.gas.retry_multiplier_bps(), 11_500);
        assert!(!config.liquidation.observer);
    }

    #[test]
    fn test_profiles() {
        let testing = SentinelConfig::testing();
        assert_eq!(testing.profile, "testing");
        assert!(testing.persistence.snapshot_path.is_none());

        let production = SentinelConfig::production();
        assert_eq!(production.profile, "production");
        assert!(production.liquidation.use_thresholds);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: SentinelConfig = toml::from_str(
            r#"
            profile = "custom"

            [sync]
            epoch_block = 1234

            [liquidation]
            max_batch_tx = 3

            [tokens]
            include = ["0x0000000000000000000000000000000000000001"]

            [[tokens.thresholds]]
            token = "0x0000000000000000000000000000000000000001"
            minimum_flow_rate = 385802469135
            "#,
        )
        .unwrap();

        assert_eq!(parsed.profile, "custom");
        assert_eq!(parsed.sync.epoch_block, 1234);
        assert_eq!(parsed.sync.block_offset, 12);
        assert_eq!(parsed.liquidation.max_batch_tx, 3);
        assert_eq!(parsed.tokens.include, vec![Address::with_last_byte(1)]);
        assert_eq!(
            parsed.tokens.thresholds()[0].minimum_flow_rate,
            I256::try_from(385_802_469_135i64).unwrap()
        );
    }

    #[test]
    fn test_serialization() {
        let mut config = SentinelConfig::testing();
        config.tokens.thresholds.push(ThresholdConfig {
            token: Address::with_last_byte(7),
            minimum_flow_rate: 1_000_000_000_000,
        });
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("profile = \"testing\""));

        let parsed: SentinelConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.profile, "testing");
        assert_eq!(parsed.queue.retry_budget, 5);
        assert_eq!(parsed.tokens.thresholds[0].minimum_flow_rate, 1_000_000_000_000);
    }
}
