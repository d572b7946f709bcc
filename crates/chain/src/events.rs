//! Agreement event decoding and live subscriptions.
//!
//! Both agreement families are decoded into one [`FlowEvent`] type so the
//! rest of the sentinel never touches raw logs.

use alloy::primitives::{Address, B256, I256, U256};
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use anyhow::Result;
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use tracing::{debug, info, warn};

use crate::contracts::{IConstantFlowAgreementV1, IGeneralDistributionAgreementV1};

/// Agreement family an event or flow belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlowSource {
    /// Constant flow agreement: sender → receiver.
    Cfa,
    /// General distribution agreement: distributor → pool.
    Gda,
}

impl FlowSource {
    pub const ALL: [FlowSource; 2] = [FlowSource::Cfa, FlowSource::Gda];

    /// topic0 of the event this family emits on every flow change.
    pub fn event_signature(self) -> B256 {
        match self {
            Self::Cfa => IConstantFlowAgreementV1::FlowUpdated::SIGNATURE_HASH,
            Self::Gda => IGeneralDistributionAgreementV1::FlowDistributionUpdated::SIGNATURE_HASH,
        }
    }
}

impl fmt::Display for FlowSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cfa => f.write_str("CFA"),
            Self::Gda => f.write_str("GDA"),
        }
    }
}

/// Optional narrowing of a log query.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Only events for these tokens (topic1). Empty means all tokens.
    pub tokens: Vec<Address>,
}

/// A decoded agreement event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    FlowUpdated {
        token: Address,
        sender: Address,
        receiver: Address,
        flow_rate: I256,
        block_number: u64,
        log_index: u64,
        tx_hash: B256,
    },
    FlowDistributionUpdated {
        token: Address,
        pool: Address,
        distributor: Address,
        operator: Address,
        old_flow_rate: U256,
        new_distributor_to_pool_flow_rate: U256,
        new_total_distribution_flow_rate: U256,
        adjustment_flow_recipient: Address,
        adjustment_flow_rate: U256,
        block_number: u64,
        log_index: u64,
        tx_hash: B256,
    },
}

impl FlowEvent {
    pub fn source(&self) -> FlowSource {
        match self {
            Self::FlowUpdated { .. } => FlowSource::Cfa,
            Self::FlowDistributionUpdated { .. } => FlowSource::Gda,
        }
    }

    pub fn token(&self) -> Address {
        match self {
            Self::FlowUpdated { token, .. } | Self::FlowDistributionUpdated { token, .. } => *token,
        }
    }

    /// The paying side: CFA sender or GDA distributor.
    pub fn sender(&self) -> Address {
        match self {
            Self::FlowUpdated { sender, .. } => *sender,
            Self::FlowDistributionUpdated { distributor, .. } => *distributor,
        }
    }

    /// The receiving side: CFA receiver or GDA pool.
    pub fn receiver(&self) -> Address {
        match self {
            Self::FlowUpdated { receiver, .. } => *receiver,
            Self::FlowDistributionUpdated { pool, .. } => *pool,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            Self::FlowUpdated { block_number, .. }
            | Self::FlowDistributionUpdated { block_number, .. } => *block_number,
        }
    }

    pub fn log_index(&self) -> u64 {
        match self {
            Self::FlowUpdated { log_index, .. }
            | Self::FlowDistributionUpdated { log_index, .. } => *log_index,
        }
    }
}

/// Build the `eth_getLogs` filter for one family over `[from, to]`.
pub fn flow_filter(
    source: FlowSource,
    agreement: Address,
    from_block: u64,
    to_block: u64,
    filter: Option<&LogFilter>,
) -> Filter {
    let mut f = Filter::new()
        .address(agreement)
        .event_signature(source.event_signature())
        .from_block(from_block)
        .to_block(to_block);

    if let Some(tokens) = filter.map(|f| &f.tokens).filter(|t| !t.is_empty()) {
        let topics: Vec<B256> = tokens.iter().map(|t| t.into_word()).collect();
        f = f.topic1(topics);
    }
    f
}

/// Decode a log of either family. Unknown or malformed logs yield `None`.
pub fn parse_flow_event(log: &Log) -> Option<FlowEvent> {
    let sig = *log.topics().first()?;

    if sig == FlowSource::Cfa.event_signature() {
        parse_flow_updated(log)
    } else if sig == FlowSource::Gda.event_signature() {
        parse_flow_distribution_updated(log)
    } else {
        None
    }
}

fn topic_address(log: &Log, index: usize) -> Option<Address> {
    log.topics().get(index).map(|t| Address::from_slice(&t[12..]))
}

fn word(data: &[u8], index: usize) -> Option<&[u8]> {
    data.get(index * 32..(index + 1) * 32)
}

fn word_address(data: &[u8], index: usize) -> Option<Address> {
    word(data, index).map(|w| Address::from_slice(&w[12..]))
}

fn word_u256(data: &[u8], index: usize) -> Option<U256> {
    word(data, index).map(U256::from_be_slice)
}

fn word_i256(data: &[u8], index: usize) -> Option<I256> {
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(word(data, index)?);
    Some(I256::from_be_bytes(bytes))
}

/// FlowUpdated(address indexed token, address indexed sender, address indexed receiver,
///             int96 flowRate, int256 totalSenderFlowRate, int256 totalReceiverFlowRate, bytes userData)
fn parse_flow_updated(log: &Log) -> Option<FlowEvent> {
    if log.topics().len() < 4 {
        warn!(address = %log.address(), "Invalid FlowUpdated log: insufficient topics");
        return None;
    }
    let data = &log.data().data;

    Some(FlowEvent::FlowUpdated {
        token: topic_address(log, 1)?,
        sender: topic_address(log, 2)?,
        receiver: topic_address(log, 3)?,
        flow_rate: word_i256(data, 0)?,
        block_number: log.block_number.unwrap_or(0),
        log_index: log.log_index.unwrap_or(0),
        tx_hash: log.transaction_hash.unwrap_or_default(),
    })
}

/// FlowDistributionUpdated(address indexed token, address indexed pool, address indexed distributor,
///   address operator, uint256 oldFlowRate, uint256 newDistributorToPoolFlowRate,
///   uint256 newTotalDistributionFlowRate, address adjustmentFlowRecipient,
///   uint256 adjustmentFlowRate, bytes userData)
fn parse_flow_distribution_updated(log: &Log) -> Option<FlowEvent> {
    if log.topics().len() < 4 {
        warn!(address = %log.address(), "Invalid FlowDistributionUpdated log: insufficient topics");
        return None;
    }
    let data = &log.data().data;

    Some(FlowEvent::FlowDistributionUpdated {
        token: topic_address(log, 1)?,
        pool: topic_address(log, 2)?,
        distributor: topic_address(log, 3)?,
        operator: word_address(data, 0)?,
        old_flow_rate: word_u256(data, 1)?,
        new_distributor_to_pool_flow_rate: word_u256(data, 2)?,
        new_total_distribution_flow_rate: word_u256(data, 3)?,
        adjustment_flow_recipient: word_address(data, 4)?,
        adjustment_flow_rate: word_u256(data, 5)?,
        block_number: log.block_number.unwrap_or(0),
        log_index: log.log_index.unwrap_or(0),
        tx_hash: log.transaction_hash.unwrap_or_default(),
    })
}

/// WebSocket listener for new agreement events.
pub struct EventListener {
    ws_url: String,
    /// Agreement contract per family
    agreements: Vec<(FlowSource, Address)>,
}

impl EventListener {
    pub fn new(ws_url: impl Into<String>, agreements: Vec<(FlowSource, Address)>) -> Self {
        Self {
            ws_url: ws_url.into(),
            agreements,
        }
    }

    /// Subscribe to both agreement families.
    ///
    /// The stream ends when the socket closes; callers resubscribe.
    pub async fn subscribe_flow_events(
        &self,
    ) -> Result<Pin<Box<dyn Stream<Item = FlowEvent> + Send>>> {
        info!(ws_url = %self.ws_url, agreements = self.agreements.len(), "Subscribing to agreement events");

        let ws = WsConnect::new(&self.ws_url);
        let provider = ProviderBuilder::new().on_ws(ws).await?;

        let filter = Filter::new()
            .address(self.agreements.iter().map(|(_, a)| *a).collect::<Vec<_>>())
            .event_signature(
                self.agreements
                    .iter()
                    .map(|(s, _)| s.event_signature())
                    .collect::<Vec<_>>(),
            );

        let sub = provider.subscribe_logs(&filter).await?;
        let inner_stream = sub.into_stream();

        // The provider lives in the stream state so the socket stays open
        let event_stream = futures::stream::unfold(
            (provider, inner_stream),
            |(provider, mut stream)| async move {
                loop {
                    let log = stream.next().await?;
                    if log.removed {
                        debug!(block = ?log.block_number, "Skipping removed log");
                        continue;
                    }
                    if let Some(event) = parse_flow_event(&log) {
                        return Some((event, (provider, stream)));
                    }
                }
            },
        );

        Ok(Box::pin(event_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, LogData};

    fn pad_address(a: Address) -> B256 {
        a.into_word()
    }

    fn make_log(topics: Vec<B256>, data: Vec<u8>, block: u64, index: u64) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: Address::repeat_byte(0xcf),
                data: LogData::new_unchecked(topics, Bytes::from(data)),
            },
            block_number: Some(block),
            log_index: Some(index),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_flow_updated_negative_rate() {
        let token = Address::repeat_byte(1);
        let sender = Address::repeat_byte(2);
        let receiver = Address::repeat_byte(3);

        let rate = I256::try_from(-1_000_000i64).unwrap();
        let mut data = Vec::new();
        data.extend_from_slice(&rate.to_be_bytes::<32>());
        data.extend_from_slice(&[0u8; 32 * 3]);

        let log = make_log(
            vec![
                FlowSource::Cfa.event_signature(),
                pad_address(token),
                pad_address(sender),
                pad_address(receiver),
            ],
            data,
            42,
            7,
        );

        let event = parse_flow_event(&log).unwrap();
        assert_eq!(event.source(), FlowSource::Cfa);
        assert_eq!(event.token(), token);
        assert_eq!(event.sender(), sender);
        assert_eq!(event.receiver(), receiver);
        assert_eq!(event.block_number(), 42);
        assert_eq!(event.log_index(), 7);
        match event {
            FlowEvent::FlowUpdated { flow_rate, .. } => assert_eq!(flow_rate, rate),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_parse_flow_distribution_updated() {
        let token = Address::repeat_byte(1);
        let pool = Address::repeat_byte(4);
        let distributor = Address::repeat_byte(5);

        let mut data = Vec::new();
        data.extend_from_slice(Address::repeat_byte(6).into_word().as_slice());
        data.extend_from_slice(&U256::from(10u64).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(20u64).to_be_bytes::<32>());
        data.extend_from_slice(&U256::from(21u64).to_be_bytes::<32>());
        data.extend_from_slice(Address::repeat_byte(7).into_word().as_slice());
        data.extend_from_slice(&U256::from(1u64).to_be_bytes::<32>());

        let log = make_log(
            vec![
                FlowSource::Gda.event_signature(),
                pad_address(token),
                pad_address(pool),
                pad_address(distributor),
            ],
            data,
            100,
            0,
        );

        let event = parse_flow_event(&log).unwrap();
        assert_eq!(event.source(), FlowSource::Gda);
        assert_eq!(event.sender(), distributor);
        assert_eq!(event.receiver(), pool);
        match event {
            FlowEvent::FlowDistributionUpdated {
                new_distributor_to_pool_flow_rate,
                adjustment_flow_rate,
                ..
            } => {
                assert_eq!(new_distributor_to_pool_flow_rate, U256::from(20u64));
                assert_eq!(adjustment_flow_rate, U256::from(1u64));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_truncated_data_is_rejected() {
        let log = make_log(
            vec![
                FlowSource::Cfa.event_signature(),
                B256::ZERO,
                B256::ZERO,
                B256::ZERO,
            ],
            vec![0u8; 10],
            1,
            0,
        );
        assert!(parse_flow_event(&log).is_none());
    }

    #[test]
    fn test_unknown_signature_is_ignored() {
        let log = make_log(vec![B256::repeat_byte(0xaa)], vec![], 1, 0);
        assert!(parse_flow_event(&log).is_none());
    }
}
