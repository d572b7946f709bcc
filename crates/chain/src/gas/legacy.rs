//! Legacy gas pricing strategy (pre-EIP-1559).

use super::GasStrategy;
use alloy::network::TransactionBuilder;
use alloy::rpc::types::TransactionRequest;
use anyhow::Result;
use async_trait::async_trait;
use tracing::warn;

/// Legacy gas pricing: a single `gas_price` field.
#[derive(Debug)]
pub struct LegacyGasStrategy {
    /// Price used when the node cannot be asked (wei).
    default_gas_price: u128,
}

impl LegacyGasStrategy {
    pub fn new(default_gas_price: u128) -> Self {
        Self { default_gas_price }
    }
}

#[async_trait]
impl GasStrategy for LegacyGasStrategy {
    async fn fetch_base_price(&self, rpc_url: &str) -> Result<u128> {
        use alloy::providers::{Provider, ProviderBuilder};

        let provider = ProviderBuilder::new().on_http(rpc_url.parse()?);
        match provider.get_gas_price().await {
            Ok(price) => Ok(price),
            Err(e) => {
                warn!(error = %e, default = self.default_gas_price, "eth_gasPrice failed, using default");
                Ok(self.default_gas_price)
            }
        }
    }

    fn apply_gas(&self, tx: &mut TransactionRequest, price: u128) {
        tx.set_gas_price(price);
    }

    fn strategy_name(&self) -> &'static str {
        "Legacy"
    }
}
