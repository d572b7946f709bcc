//! Contract bindings for the streaming protocol.
//!
//! # Example
//!
//! ```rust,ignore
//! use sentinel_chain::contracts::{encode_cfa_delete, encode_batch, BatchItem};
//!
//! // L1-style: route through the host
//! let calldata = encode_cfa_delete(addresses.cfa, token, sender, receiver);
//!
//! // Rollup-style: one call closes several flows of the same token
//! let calldata = encode_batch(token, &[BatchItem { source, sender, receiver }]);
//! ```

pub mod batch_liquidator;
pub mod superfluid;

pub use batch_liquidator::{encode_batch, BatchItem, IBatchLiquidator};
pub use superfluid::{
    encode_cfa_delete, encode_gda_stop, precondition_error_selectors, IConstantFlowAgreementV1,
    IGeneralDistributionAgreementV1, ISuperToken, ISuperfluid, ISuperfluidGovernance, ITOGA,
};

use alloy::primitives::Address;
use serde::{Deserialize, Serialize};

/// Deployed protocol contracts the sentinel talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolAddresses {
    /// Protocol host
    pub host: Address,
    /// Constant flow agreement class
    pub cfa: Address,
    /// General distribution agreement class (not deployed on every network)
    #[serde(default)]
    pub gda: Option<Address>,
    /// Priority-bond contract (TOGA)
    #[serde(default)]
    pub toga: Option<Address>,
    /// Batch liquidator helper
    #[serde(default)]
    pub batch_liquidator: Option<Address>,
}
