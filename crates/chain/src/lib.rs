//! Sentinel chain interaction layer.
//!
//! This crate provides:
//! - Contract bindings for the streaming protocol and the batch liquidator
//! - Agreement event decoding (CFA and GDA) and WebSocket subscriptions
//! - The [`ChainRpc`] collaborator trait and its Alloy implementation
//! - Transaction signing and local nonce allocation
//! - Gas strategy abstraction (Legacy + EIP-1559)
//! - Classification of node and EVM rejections

pub mod contracts;
pub mod errors;
pub mod events;
pub mod gas;
mod provider;
mod signer;

pub use contracts::{encode_batch, encode_cfa_delete, encode_gda_stop, BatchItem, ProtocolAddresses};
pub use errors::TxError;
pub use events::{EventListener, FlowEvent, FlowSource, LogFilter};
pub use provider::{
    BroadcastReceipt, CallRequest, ChainRpc, PriorityInfo, ProviderManager, TokenInfo, UnsignedTx,
};
pub use signer::{NonceManager, TransactionSigner};
