//! Operator wallet: local nonce allocation and offline signing.
//!
//! Signing never touches the network. The engine fetches the nonce once per
//! liquidation pass, then allocates locally so that single and batch sends
//! within the pass never collide.

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::gas::GasStrategy;
use crate::provider::UnsignedTx;

/// Monotonic nonce allocator for one liquidation pass.
#[derive(Debug)]
pub struct NonceManager {
    /// Next nonce to hand out
    current: AtomicU64,
}

impl NonceManager {
    /// Create from the on-chain transaction count.
    pub fn new(initial_nonce: u64) -> Self {
        Self {
            current: AtomicU64::new(initial_nonce),
        }
    }

    /// Get next nonce and increment counter.
    #[inline]
    pub fn next(&self) -> u64 {
        self.current.fetch_add(1, Ordering::SeqCst)
    }

    /// Get current nonce without incrementing.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// Make sure later allocations start after `used`.
    ///
    /// Called when the node reports a nonce as consumed. Never moves backwards.
    pub fn mark_used(&self, used: u64) {
        self.current.fetch_max(used.saturating_add(1), Ordering::SeqCst);
    }

    /// Return `nonce` if it is still the last one handed out.
    ///
    /// For transactions the node rejected outright, so the next send reuses
    /// the slot instead of leaving a gap. Returns whether the rewind happened.
    pub fn release(&self, nonce: u64) -> bool {
        self.current
            .compare_exchange(nonce.saturating_add(1), nonce, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Signs transactions with the operator key.
pub struct TransactionSigner {
    wallet: EthereumWallet,
    /// Signer address
    pub address: Address,
    chain_id: u64,
    gas_strategy: Arc<dyn GasStrategy>,
}

impl TransactionSigner {
    /// Parse a private key (with or without 0x prefix).
    pub fn new(private_key: &str, chain_id: u64, gas_strategy: Arc<dyn GasStrategy>) -> Result<Self> {
        let key_str = private_key.trim_start_matches("0x");
        let signer: PrivateKeySigner = key_str.parse()?;
        let address = signer.address();

        Ok(Self {
            wallet: EthereumWallet::from(signer),
            address,
            chain_id,
            gas_strategy,
        })
    }

    pub fn gas_strategy(&self) -> &dyn GasStrategy {
        self.gas_strategy.as_ref()
    }

    /// Build the request for an unsigned transaction, with fees applied.
    pub fn request(&self, tx: &UnsignedTx) -> TransactionRequest {
        let mut request = TransactionRequest::default()
            .with_from(self.address)
            .with_to(tx.to)
            .with_input(tx.data.clone())
            .with_value(U256::ZERO)
            .with_nonce(tx.nonce)
            .with_gas_limit(tx.gas_limit)
            .with_chain_id(self.chain_id);
        self.gas_strategy.apply_gas(&mut request, tx.gas_price);
        request
    }

    /// Sign and return the EIP-2718 encoded bytes ready for `eth_sendRawTransaction`.
    pub async fn sign(&self, tx: &UnsignedTx) -> Result<Bytes> {
        let envelope = self.request(tx).build(&self.wallet).await?;
        let raw = envelope.encoded_2718();

        debug!(
            to = %tx.to,
            nonce = tx.nonce,
            gas_limit = tx.gas_limit,
            gas_price = tx.gas_price,
            raw_len = raw.len(),
            "Transaction signed"
        );
        Ok(Bytes::from(raw))
    }
}

impl std::fmt::Debug for TransactionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSigner")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("gas_strategy", &self.gas_strategy.strategy_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas::LegacyGasStrategy;

    // Well-known development key (DO NOT USE IN PRODUCTION)
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_nonce_manager() {
        let manager = NonceManager::new(10);

        assert_eq!(manager.current(), 10);
        assert_eq!(manager.next(), 10);
        assert_eq!(manager.next(), 11);
        assert_eq!(manager.current(), 12);

        // A consumed nonce ahead of us pushes allocation forward
        manager.mark_used(20);
        assert_eq!(manager.next(), 21);

        // Never moves backwards
        manager.mark_used(5);
        assert_eq!(manager.current(), 22);
    }

    #[test]
    fn test_release_only_rewinds_last_nonce() {
        let manager = NonceManager::new(3);
        let first = manager.next();
        let second = manager.next();

        // Not the latest allocation
        assert!(!manager.release(first));
        assert_eq!(manager.current(), 5);

        assert!(manager.release(second));
        assert_eq!(manager.next(), 4);

        // A nonce the node consumed stays consumed
        manager.mark_used(9);
        assert!(!manager.release(4));
        assert_eq!(manager.current(), 10);
    }

    #[test]
    fn test_signer_address() {
        let signer =
            TransactionSigner::new(DEV_KEY, 1, Arc::new(LegacyGasStrategy::new(1))).unwrap();
        assert_eq!(
            format!("{:?}", signer.address).to_lowercase(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[tokio::test]
    async fn test_sign_produces_legacy_envelope() {
        let signer =
            TransactionSigner::new(DEV_KEY, 5, Arc::new(LegacyGasStrategy::new(1))).unwrap();
        let tx = UnsignedTx {
            to: Address::repeat_byte(1),
            data: Bytes::from(vec![0xde, 0xad]),
            nonce: 3,
            gas_limit: 100_000,
            gas_price: 2_000_000_000,
        };

        let raw = signer.sign(&tx).await.unwrap();
        // Legacy transactions are RLP lists, no type byte
        assert!(raw[0] >= 0xc0);
    }
}
