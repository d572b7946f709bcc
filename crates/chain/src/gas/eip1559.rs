//! EIP-1559 gas pricing strategy.
//!
//! The engine's single price becomes `max_fee_per_gas`; the tip is whatever
//! the price leaves above the last seen base fee, so bumping the price bumps
//! both fields as replacement rules require.

use super::GasStrategy;
use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

/// Minimum tip (wei) when the price barely covers the base fee.
const MIN_PRIORITY_FEE: u128 = 1_000_000;

#[derive(Debug)]
pub struct Eip1559GasStrategy {
    /// Price used when the node cannot be asked (wei).
    default_price: u128,
    /// Last observed base fee (wei).
    cached_base_fee: AtomicU64,
}

impl Eip1559GasStrategy {
    pub fn new(default_price: u128) -> Self {
        Self {
            default_price,
            cached_base_fee: AtomicU64::new(0),
        }
    }

    pub fn cached_base_fee(&self) -> u128 {
        self.cached_base_fee.load(Ordering::Relaxed) as u128
    }

    fn priority_fee_for(&self, price: u128) -> u128 {
        price
            .saturating_sub(self.cached_base_fee())
            .max(MIN_PRIORITY_FEE)
            .min(price)
    }
}

#[async_trait]
impl GasStrategy for Eip1559GasStrategy {
    async fn fetch_base_price(&self, rpc_url: &str) -> Result<u128> {
        use alloy::providers::{Provider, ProviderBuilder};

        let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);
        let block = provider
            .get_block_by_number(alloy::eips::BlockNumberOrTag::Latest)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to get latest block"))?;

        let base_fee = block.header.base_fee_per_gas.map(|b| b as u128);
        let Some(base_fee) = base_fee else {
            return Ok(self.default_price);
        };
        self.cached_base_fee
            .store(base_fee.min(u64::MAX as u128) as u64, Ordering::Relaxed);

        let tip = provider
            .get_max_priority_fee_per_gas()
            .await
            .unwrap_or(MIN_PRIORITY_FEE);

        Ok(base_fee.saturating_add(tip))
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, price: u128) {
        tx.set_max_fee_per_gas(price);
        tx.set_max_priority_fee_per_gas(self.priority_fee_for(price));
    }

    fn strategy_name(&self) -> &'static str {
        "EIP-1559"
    }
}
