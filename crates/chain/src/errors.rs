//! Classification of node and EVM rejections.
//!
//! Nodes report transaction failures as free-form JSON-RPC error text, so
//! classification matches on well-known fragments (geth, erigon, nethermind
//! and reth wording) and on the selectors of the protocol's custom errors.

use thiserror::Error;

use crate::contracts::precondition_error_selectors;

/// A typed rejection the transaction engine knows how to recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
    /// A transaction with the same nonce is pending at a higher price.
    #[error("replacement transaction underpriced")]
    ReplacementUnderpriced,
    /// The nonce has already been consumed.
    #[error("nonce too low")]
    NonceTooLow,
    /// This exact transaction is already in the node's pool.
    #[error("transaction already known")]
    AlreadyKnown,
    /// The operator wallet cannot pay for gas.
    #[error("insufficient funds for gas")]
    InsufficientFunds,
    /// The flow is gone or the sender is no longer critical.
    #[error("flow does not exist or sender is not critical")]
    FlowDoesNotExist,
    /// Any other revert.
    #[error("execution reverted")]
    Reverted,
    /// Network-level or unknown failure; worth retrying.
    #[error("transient rpc failure")]
    Transient,
}

const UNDERPRICED: &[&str] = &[
    "replacement transaction underpriced",
    "replacement fee too low",
    "transaction underpriced",
    "underpriced",
];
const NONCE_TOO_LOW: &[&str] = &["nonce too low", "nonce has already been used", "oldnonce"];
const ALREADY_KNOWN: &[&str] = &["already known", "already imported", "known transaction"];
const INSUFFICIENT_FUNDS: &[&str] = &["insufficient funds", "insufficient balance for transfer"];
const FLOW_GONE: &[&str] = &[
    "flow does not exist",
    "cfa_flow_does_not_exist",
    "cfa_non_critical_sender",
    "gda_non_critical_sender",
];

impl TxError {
    /// Classify an error message.
    pub fn classify(message: &str) -> Self {
        let m = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

        // Revert reasons are checked first; "underpriced" is a suffix of other messages.
        if has(FLOW_GONE) || contains_precondition_selector(&m) {
            Self::FlowDoesNotExist
        } else if has(NONCE_TOO_LOW) {
            Self::NonceTooLow
        } else if has(ALREADY_KNOWN) {
            Self::AlreadyKnown
        } else if has(INSUFFICIENT_FUNDS) {
            Self::InsufficientFunds
        } else if has(UNDERPRICED) {
            Self::ReplacementUnderpriced
        } else if m.contains("revert") {
            Self::Reverted
        } else {
            Self::Transient
        }
    }

    /// Classify an `anyhow` error using its full context chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if let Some(typed) = err.downcast_ref::<TxError>() {
            return *typed;
        }
        Self::classify(&format!("{err:#}"))
    }
}

fn contains_precondition_selector(lowercase_message: &str) -> bool {
    precondition_error_selectors()
        .iter()
        .any(|selector| lowercase_message.contains(&hex::encode(selector)))
}
