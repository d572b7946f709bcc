//! Streaming protocol contract interfaces.
//!
//! Agreement classes (CFA, GDA), the host, super tokens, the priority-bond
//! contract (TOGA) and governance. Only the subset the sentinel reads or
//! calls is declared.
//!
//! `int96` values are ABI-padded to a full word, so view functions returning
//! `int96` are declared here as `int256`. Selectors only depend on the input
//! types, and decoding the padded word as `int256` is lossless.

use alloy::primitives::{aliases::I96, Address, Bytes};
use alloy::sol;
use alloy::sol_types::{SolCall, SolError};

sol! {
    /// Constant flow agreement (CFA v1).
    #[sol(rpc)]
    interface IConstantFlowAgreementV1 {
        event FlowUpdated(
            address indexed token,
            address indexed sender,
            address indexed receiver,
            int96 flowRate,
            int256 totalSenderFlowRate,
            int256 totalReceiverFlowRate,
            bytes userData
        );

        function getNetFlow(address token, address account) external view returns (int256 flowRate);

        function getFlow(address token, address sender, address receiver)
            external
            view
            returns (uint256 timestamp, int256 flowRate, uint256 deposit, uint256 owedDeposit);

        function deleteFlow(address token, address sender, address receiver, bytes ctx)
            external
            returns (bytes newCtx);
    }

    /// General distribution agreement (GDA v1).
    #[sol(rpc)]
    interface IGeneralDistributionAgreementV1 {
        event FlowDistributionUpdated(
            address indexed token,
            address indexed pool,
            address indexed distributor,
            address operator,
            uint256 oldFlowRate,
            uint256 newDistributorToPoolFlowRate,
            uint256 newTotalDistributionFlowRate,
            address adjustmentFlowRecipient,
            uint256 adjustmentFlowRate,
            bytes userData
        );

        function getNetFlow(address token, address account) external view returns (int256 flowRate);

        function getFlowRate(address token, address from, address to) external view returns (int256 flowRate);

        function distributeFlow(address token, address from, address pool, int96 requestedFlowRate, bytes ctx)
            external
            returns (bytes newCtx);
    }

    /// Protocol host; every agreement call is routed through it.
    #[sol(rpc)]
    interface ISuperfluid {
        function getGovernance() external view returns (address governance);

        function callAgreement(address agreementClass, bytes callData, bytes userData)
            external
            returns (bytes returnedData);
    }

    /// Super token (streaming-capable ERC20).
    #[sol(rpc)]
    interface ISuperToken {
        function symbol() external view returns (string symbol);
        function name() external view returns (string name);

        function realtimeBalanceOfNow(address account)
            external
            view
            returns (int256 availableBalance, uint256 deposit, uint256 owedDeposit, uint256 timestamp);

        function isAccountCriticalNow(address account) external view returns (bool isCritical);
    }

    /// Priority-bond auction contract.
    #[sol(rpc)]
    interface ITOGA {
        function getCurrentPIC(address token) external view returns (address pic);
    }

    /// Protocol governance: liquidation periods and reward address.
    #[sol(rpc)]
    interface ISuperfluidGovernance {
        function getPPPConfig(address host, address superToken)
            external
            view
            returns (uint256 liquidationPeriod, uint256 patricianPeriod);

        function getRewardAddress(address host, address superToken) external view returns (address rewardAddress);
    }

    /// Reverts raised when the flow being closed is already gone or the
    /// sender is no longer critical.
    error CFA_FLOW_DOES_NOT_EXIST();
    error CFA_NON_CRITICAL_SENDER();
    error GDA_NON_CRITICAL_SENDER();
}

/// Selectors of the custom errors that mean "nothing left to liquidate".
pub fn precondition_error_selectors() -> [[u8; 4]; 3] {
    [
        CFA_FLOW_DOES_NOT_EXIST::SELECTOR,
        CFA_NON_CRITICAL_SENDER::SELECTOR,
        GDA_NON_CRITICAL_SENDER::SELECTOR,
    ]
}

/// Encode `host.callAgreement(cfa, deleteFlow(token, sender, receiver, ""), "")`.
pub fn encode_cfa_delete(cfa: Address, token: Address, sender: Address, receiver: Address) -> Bytes {
    let inner = IConstantFlowAgreementV1::deleteFlowCall {
        token,
        sender,
        receiver,
        ctx: Bytes::new(),
    };
    encode_call_agreement(cfa, Bytes::from(inner.abi_encode()))
}

/// Encode `host.callAgreement(gda, distributeFlow(token, distributor, pool, 0, ""), "")`.
pub fn encode_gda_stop(gda: Address, token: Address, distributor: Address, pool: Address) -> Bytes {
    let inner = IGeneralDistributionAgreementV1::distributeFlowCall {
        token,
        from: distributor,
        pool,
        requestedFlowRate: I96::ZERO,
        ctx: Bytes::new(),
    };
    encode_call_agreement(gda, Bytes::from(inner.abi_encode()))
}

fn encode_call_agreement(agreement: Address, call_data: Bytes) -> Bytes {
    let call = ISuperfluid::callAgreementCall {
        agreementClass: agreement,
        callData: call_data,
        userData: Bytes::new(),
    };
    Bytes::from(call.abi_encode())
}
