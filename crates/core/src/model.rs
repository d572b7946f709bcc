//! Persisted records and in-memory tasks.

use alloy::primitives::{keccak256, Address, B256, I256, U256};
use sentinel_chain::{FlowEvent, FlowSource};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a flow: `keccak256(token ++ sender ++ receiver)`.
///
/// For distributions the receiver is the pool.
pub fn agreement_id(token: Address, sender: Address, receiver: Address) -> B256 {
    let mut buf = [0u8; 60];
    buf[..20].copy_from_slice(token.as_slice());
    buf[20..40].copy_from_slice(sender.as_slice());
    buf[40..].copy_from_slice(receiver.as_slice());
    keccak256(buf)
}

/// Latest state of one flow. `flow_rate == 0` means terminated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agreement {
    pub agreement_id: B256,
    pub super_token: Address,
    pub sender: Address,
    /// CFA receiver or GDA pool
    pub receiver: Address,
    pub flow_rate: I256,
    pub block_number: u64,
    pub source: FlowSource,
}

impl Agreement {
    pub fn is_open(&self) -> bool {
        !self.flow_rate.is_zero()
    }
}

/// Latest state of one distributor → pool distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDistribution {
    pub agreement_id: B256,
    pub super_token: Address,
    pub pool: Address,
    pub distributor: Address,
    pub operator: Address,
    pub old_flow_rate: U256,
    pub new_distributor_to_pool_flow_rate: U256,
    pub new_total_distribution_flow_rate: U256,
    pub adjustment_flow_rate: U256,
    pub block_number: u64,
}

/// A normalized event: the agreement row plus, for GDA, the distribution row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub agreement: Agreement,
    pub distribution: Option<FlowDistribution>,
}

impl From<&FlowEvent> for NormalizedEvent {
    fn from(event: &FlowEvent) -> Self {
        let token = event.token();
        let sender = event.sender();
        let receiver = event.receiver();
        let id = agreement_id(token, sender, receiver);
        let block_number = event.block_number();

        let (flow_rate, distribution) = match event {
            FlowEvent::FlowUpdated { flow_rate, .. } => (*flow_rate, None),
            FlowEvent::FlowDistributionUpdated {
                operator,
                old_flow_rate,
                new_distributor_to_pool_flow_rate,
                new_total_distribution_flow_rate,
                adjustment_flow_rate,
                ..
            } => (
                I256::from_raw(*new_distributor_to_pool_flow_rate),
                Some(FlowDistribution {
                    agreement_id: id,
                    super_token: token,
                    pool: receiver,
                    distributor: sender,
                    operator: *operator,
                    old_flow_rate: *old_flow_rate,
                    new_distributor_to_pool_flow_rate: *new_distributor_to_pool_flow_rate,
                    new_total_distribution_flow_rate: *new_total_distribution_flow_rate,
                    adjustment_flow_rate: *adjustment_flow_rate,
                    block_number,
                }),
            ),
        };

        Self {
            block_number,
            log_index: event.log_index(),
            agreement: Agreement {
                agreement_id: id,
                super_token: token,
                sender,
                receiver,
                flow_rate,
                block_number,
                source: event.source(),
            },
            distribution,
        }
    }
}

/// Projected insolvency of one `(account, token)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEstimation {
    pub address: Address,
    pub super_token: Address,
    pub net_flow_rate: I256,
    pub balance: I256,
    /// Unix seconds; `0` means no risk.
    pub estimated_insolvency_timestamp: u64,
    pub last_checked_at: u64,
    pub recalculate: bool,
}

/// How the priority resolver classified this agent for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PriorityMode {
    /// Not resolved yet.
    #[default]
    Unresolved,
    /// We hold the bond or are the reward address: no delay.
    Patrician,
    /// Someone else has priority: wait out the patrician period.
    Plebeian,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperToken {
    pub address: Address,
    pub symbol: String,
    pub name: String,
    pub priority_bond_holder: Option<Address>,
    pub priority_mode: PriorityMode,
    pub liquidation_period: u64,
    pub patrician_period: u64,
    pub listed: bool,
    /// Seconds to wait after insolvency before acting.
    pub delay_seconds: u64,
}

/// Durable sync watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemCheckpoint {
    pub chain_id: u64,
    pub last_event_scan_block: u64,
    pub last_bootstrap_block: Option<u64>,
}

/// Minimum absolute flow rate worth liquidating on a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    pub token: Address,
    pub minimum_flow_rate: I256,
}

/// Queue work item.
pub trait Keyed {
    /// De-duplication key; pushing a pending key is a no-op.
    fn key(&self) -> String;

    /// Called before each retry with the attempt number.
    fn on_retry(&mut self, _attempt: u32) {}
}

/// Estimation (or window scan) work for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub account: Address,
    pub token: Address,
    pub block_range: Option<(u64, u64)>,
    pub retry_count: u32,
    pub parent_caller: &'static str,
}

impl Task {
    pub fn estimate(token: Address, account: Address, parent_caller: &'static str) -> Self {
        Self {
            account,
            token,
            block_range: None,
            retry_count: 0,
            parent_caller,
        }
    }

    /// Per-token work such as resolving the priority delay.
    pub fn token(token: Address, parent_caller: &'static str) -> Self {
        Self::estimate(token, Address::ZERO, parent_caller)
    }

    pub fn window(from_block: u64, to_block: u64) -> Self {
        Self {
            account: Address::ZERO,
            token: Address::ZERO,
            block_range: Some((from_block, to_block)),
            retry_count: 0,
            parent_caller: "sync",
        }
    }
}

impl Keyed for Task {
    fn key(&self) -> String {
        match self.block_range {
            Some((from, to)) => format!("window:{from}-{to}"),
            None => format!("{}:{}", self.token, self.account),
        }
    }

    fn on_retry(&mut self, attempt: u32) {
        self.retry_count = attempt;
    }
}

/// Re-derive one agreement at a block and fan out estimations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementTask {
    pub source: FlowSource,
    pub token: Address,
    pub sender: Address,
    pub receiver: Address,
    pub block_number: u64,
    pub retry_count: u32,
}

impl Keyed for AgreementTask {
    fn key(&self) -> String {
        format!("{}:{}:{}:{}", self.source, self.token, self.sender, self.receiver)
    }

    fn on_retry(&mut self, attempt: u32) {
        self.retry_count = attempt;
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_id_is_directional() {
        let t = Address::repeat_byte(1);
        let a = Address::repeat_byte(2);
        let b = Address::repeat_byte(3);
        assert_eq!(agreement_id(t, a, b), agreement_id(t, a, b));
        assert_ne!(agreement_id(t, a, b), agreement_id(t, b, a));
    }

    #[test]
    fn test_task_keys() {
        let t = Address::repeat_byte(1);
        let a = Address::repeat_byte(2);
        let task = Task::estimate(t, a, "test");
        assert_eq!(task.key(), format!("{t}:{a}"));
        assert_eq!(Task::window(10, 20).key(), "window:10-20");
    }

    #[test]
    fn test_normalize_distribution_event() {
        let event = FlowEvent::FlowDistributionUpdated {
            token: Address::repeat_byte(1),
            pool: Address::repeat_byte(2),
            distributor: Address::repeat_byte(3),
            operator: Address::repeat_byte(3),
            old_flow_rate: U256::ZERO,
            new_distributor_to_pool_flow_rate: U256::from(500),
            new_total_distribution_flow_rate: U256::from(500),
            adjustment_flow_recipient: Address::ZERO,
            adjustment_flow_rate: U256::ZERO,
            block_number: 7,
            log_index: 2,
            tx_hash: B256::ZERO,
        };

        let normalized = NormalizedEvent::from(&event);
        assert_eq!(normalized.agreement.source, FlowSource::Gda);
        assert_eq!(normalized.agreement.sender, Address::repeat_byte(3));
        assert_eq!(normalized.agreement.receiver, Address::repeat_byte(2));
        assert_eq!(normalized.agreement.flow_rate, I256::try_from(500).unwrap());
        let distribution = normalized.distribution.unwrap();
        assert_eq!(distribution.agreement_id, normalized.agreement.agreement_id);
        assert_eq!(distribution.block_number, 7);
    }
}
