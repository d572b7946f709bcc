//! Gas pricing strategies.
//!
//! The transaction engine decides *how much* to pay per attempt (base price,
//! retry multiplier, cap). A strategy decides where the base price comes
//! from and how a price is written into a transaction request.
//!
//! # Example
//!
//! ```rust,ignore
//! use sentinel_chain::gas::{create_gas_strategy, GasStrategy};
//!
//! let strategy = create_gas_strategy("legacy", 1_000_000_000);
//! let base = strategy.fetch_base_price(&rpc_url).await?;
//! strategy.apply_gas(&mut tx, base);
//! ```

mod eip1559;
mod legacy;

pub use eip1559::Eip1559GasStrategy;
pub use legacy::LegacyGasStrategy;

use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for gas pricing strategies.
#[async_trait]
pub trait GasStrategy: Send + Sync + Debug {
    /// Fetch the network's current price in wei.
    async fn fetch_base_price(&self, rpc_url: &str) -> Result<u128>;

    /// Write `price` (wei) into the transaction's fee fields.
    fn apply_gas(&self, tx: &mut TransactionRequest, price: u128);

    /// Get the strategy name for logging/debugging.
    fn strategy_name(&self) -> &'static str;
}

/// Create a gas strategy from its configured name.
///
/// Unknown names fall back to Legacy, which every EVM chain accepts.
pub fn create_gas_strategy(pricing_model: &str, default_price_wei: u128) -> Box<dyn GasStrategy> {
    match pricing_model.to_lowercase().as_str() {
        "eip1559" | "eip-1559" => Box::new(Eip1559GasStrategy::new(default_price_wei)),
        _ => Box::new(LegacyGasStrategy::new(default_price_wei)),
    }
}
