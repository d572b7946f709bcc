//! Batch liquidator interface.
//!
//! Closes several flows of one token in a single transaction. On rollups
//! this is also used for single liquidations since its calldata is smaller
//! than the nested host encoding.

use alloy::primitives::{Address, Bytes};
use alloy::sol;
use alloy::sol_types::SolCall;

use crate::events::FlowSource;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    enum FlowType {
        ConstantFlowAgreement,
        GeneralDistributionAgreement
    }

    #[derive(Debug)]
    struct FlowLiquidationData {
        FlowType agreementOperation;
        address sender;
        address receiver;
    }

    #[sol(rpc)]
    interface IBatchLiquidator {
        function deleteFlow(address superToken, FlowLiquidationData data) external;
        function deleteFlows(address superToken, FlowLiquidationData[] data) external;
    }
}

/// One flow to close: the sender and either the receiver (CFA) or the pool (GDA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchItem {
    pub source: FlowSource,
    pub sender: Address,
    pub receiver: Address,
}

impl From<BatchItem> for FlowLiquidationData {
    fn from(item: BatchItem) -> Self {
        let operation = match item.source {
            FlowSource::Cfa => FlowType::ConstantFlowAgreement,
            FlowSource::Gda => FlowType::GeneralDistributionAgreement,
        };
        Self {
            agreementOperation: operation,
            sender: item.sender,
            receiver: item.receiver,
        }
    }
}

/// Encode a batch call. A single item uses the cheaper `deleteFlow` entry point.
pub fn encode_batch(token: Address, items: &[BatchItem]) -> Bytes {
    if let [item] = items {
        let call = IBatchLiquidator::deleteFlowCall {
            superToken: token,
            data: (*item).into(),
        };
        return Bytes::from(call.abi_encode());
    }

    let call = IBatchLiquidator::deleteFlowsCall {
        superToken: token,
        data: items.iter().copied().map(Into::into).collect(),
    };
    Bytes::from(call.abi_encode())
}
