//! Conditions that terminate the process.

use alloy::primitives::Address;
use thiserror::Error;

/// A condition the agent must not continue past.
///
/// Raised through [`Shutdown::trigger_fatal`](crate::shutdown::Shutdown::trigger_fatal);
/// the binary notifies and exits with status 1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("chain id mismatch: checkpoint has {expected}, RPC reports {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },

    #[error("{queue} queue exhausted its retry budget on {key}: {reason}")]
    RetryBudgetExhausted {
        queue: &'static str,
        key: String,
        reason: String,
    },

    #[error("operator account {account} has no native balance")]
    UnfundedAccount { account: Address },

    #[error("no signing key configured outside observer mode")]
    MissingSigner,
}
