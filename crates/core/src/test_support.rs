//! Scripted collaborators for unit tests.

use alloy::primitives::{Address, Bytes, B256, I256, U256};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use sentinel_chain::{
    BroadcastReceipt, CallRequest, ChainRpc, FlowEvent, FlowSource, LogFilter, PriorityInfo,
    TokenInfo, UnsignedTx,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::notifier::Notifier;

/// What the next broadcast does.
#[derive(Debug, Clone)]
pub enum MockBroadcast {
    Confirm,
    /// Mined but reverted
    Revert,
    /// Node rejects with this message
    Fail(String),
    /// Never answers
    Hang,
}

#[derive(Default)]
struct MockState {
    chain_id: u64,
    head: u64,
    logs: Vec<FlowEvent>,
    net_flow: HashMap<(Address, Address), I256>,
    balance: HashMap<(Address, Address), I256>,
    flow_rate: HashMap<(Address, FlowSource, Address, Address), I256>,
    not_critical: Vec<(Address, Address)>,
    priority: HashMap<Address, PriorityInfo>,
    tx_count: u64,
    native_balance: U256,
    gas_price: u128,
    estimate_error: Option<String>,
    broadcasts: VecDeque<MockBroadcast>,
    signed: Vec<UnsignedTx>,
    sent: Vec<UnsignedTx>,
    signer: Option<Address>,
}

/// In-memory chain with scripted answers.
pub struct MockRpc {
    state: Mutex<MockState>,
    pub chain_id_calls: AtomicUsize,
    pub block_number_calls: AtomicUsize,
    pub log_calls: AtomicUsize,
}

impl MockRpc {
    pub fn new(chain_id: u64) -> Self {
        Self {
            state: Mutex::new(MockState {
                chain_id,
                gas_price: 1_000_000_000,
                native_balance: U256::from(10u64).pow(U256::from(18u64)),
                signer: Some(Address::repeat_byte(0xee)),
                ..MockState::default()
            }),
            chain_id_calls: AtomicUsize::new(0),
            block_number_calls: AtomicUsize::new(0),
            log_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    pub fn push_log(&self, event: FlowEvent) {
        self.state.lock().logs.push(event);
    }

    /// Set net flow and balance for an account.
    pub fn set_account(&self, token: Address, account: Address, net_flow: i64, balance: i64) {
        let mut state = self.state.lock();
        state.net_flow.insert((token, account), I256::try_from(net_flow).unwrap());
        state.balance.insert((token, account), I256::try_from(balance).unwrap());
    }

    pub fn set_flow(&self, token: Address, sender: Address, receiver: Address, rate: i64) {
        self.state.lock().flow_rate.insert(
            (token, FlowSource::Cfa, sender, receiver),
            I256::try_from(rate).unwrap(),
        );
    }

    pub fn set_not_critical(&self, token: Address, account: Address) {
        self.state.lock().not_critical.push((token, account));
    }

    pub fn set_priority(&self, token: Address, info: PriorityInfo) {
        self.state.lock().priority.insert(token, info);
    }

    pub fn set_tx_count(&self, count: u64) {
        self.state.lock().tx_count = count;
    }

    pub fn set_native_balance(&self, balance: U256) {
        self.state.lock().native_balance = balance;
    }

    pub fn set_signer(&self, signer: Option<Address>) {
        self.state.lock().signer = signer;
    }

    pub fn set_gas_price(&self, price: u128) {
        self.state.lock().gas_price = price;
    }

    pub fn set_estimate_error(&self, message: &str) {
        self.state.lock().estimate_error = Some(message.to_string());
    }

    pub fn script_broadcasts(&self, outcomes: impl IntoIterator<Item = MockBroadcast>) {
        self.state.lock().broadcasts.extend(outcomes);
    }

    /// Every transaction handed to `broadcast`, in order.
    pub fn sent(&self) -> Vec<UnsignedTx> {
        self.state.lock().sent.clone()
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn chain_id(&self) -> Result<u64> {
        self.chain_id_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().chain_id)
    }

    async fn current_block_number(&self, offset: u64) -> Result<u64> {
        self.block_number_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().head.saturating_sub(offset))
    }

    async fn get_logs(
        &self,
        source: FlowSource,
        from_block: u64,
        to_block: u64,
        filter: Option<&LogFilter>,
    ) -> Result<Vec<FlowEvent>> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .logs
            .iter()
            .filter(|e| e.source() == source)
            .filter(|e| (from_block..=to_block).contains(&e.block_number()))
            .filter(|e| filter.map_or(true, |f| f.tokens.is_empty() || f.tokens.contains(&e.token())))
            .cloned()
            .collect())
    }

    async fn net_flow_rate(&self, token: Address, account: Address) -> Result<I256> {
        Ok(self
            .state
            .lock()
            .net_flow
            .get(&(token, account))
            .copied()
            .unwrap_or(I256::ZERO))
    }

    async fn realtime_balance(&self, token: Address, account: Address) -> Result<I256> {
        Ok(self
            .state
            .lock()
            .balance
            .get(&(token, account))
            .copied()
            .unwrap_or(I256::ZERO))
    }

    async fn flow_rate(
        &self,
        token: Address,
        source: FlowSource,
        sender: Address,
        receiver: Address,
    ) -> Result<I256> {
        Ok(self
            .state
            .lock()
            .flow_rate
            .get(&(token, source, sender, receiver))
            .copied()
            .unwrap_or(I256::ZERO))
    }

    async fn is_critical(&self, token: Address, account: Address) -> Result<bool> {
        Ok(!self.state.lock().not_critical.contains(&(token, account)))
    }

    async fn token_info(&self, token: Address) -> Result<TokenInfo> {
        Ok(TokenInfo {
            symbol: format!("T{}", token.0[19]),
            name: "Mock Super Token".to_string(),
            liquidation_period: 14_400,
            patrician_period: 1_800,
        })
    }

    async fn priority_info(&self, token: Address) -> Result<PriorityInfo> {
        self.state
            .lock()
            .priority
            .get(&token)
            .copied()
            .ok_or_else(|| anyhow!("no priority info for {token}"))
    }

    async fn transaction_count(&self, _account: Address) -> Result<u64> {
        Ok(self.state.lock().tx_count)
    }

    async fn native_balance(&self, _account: Address) -> Result<U256> {
        Ok(self.state.lock().native_balance)
    }

    async fn estimate_gas(&self, _call: &CallRequest) -> Result<u64> {
        match &self.state.lock().estimate_error {
            Some(message) => Err(anyhow!("{message}")),
            None => Ok(200_000),
        }
    }

    async fn current_gas_price(&self) -> Result<u128> {
        Ok(self.state.lock().gas_price)
    }

    async fn sign(&self, tx: &UnsignedTx) -> Result<Bytes> {
        let mut state = self.state.lock();
        state.signed.push(tx.clone());
        Ok(Bytes::from((state.signed.len() - 1).to_be_bytes().to_vec()))
    }

    async fn broadcast(&self, raw: &Bytes) -> Result<BroadcastReceipt> {
        let outcome = {
            let mut state = self.state.lock();
            let mut index = [0u8; 8];
            index.copy_from_slice(&raw[..8]);
            let tx = state.signed[usize::from_be_bytes(index)].clone();
            state.sent.push(tx);
            state.broadcasts.pop_front().unwrap_or(MockBroadcast::Confirm)
        };

        match outcome {
            MockBroadcast::Confirm => Ok(BroadcastReceipt {
                tx_hash: B256::repeat_byte(0x11),
                block_number: Some(1),
                success: true,
            }),
            MockBroadcast::Revert => Ok(BroadcastReceipt {
                tx_hash: B256::repeat_byte(0x22),
                block_number: Some(1),
                success: false,
            }),
            MockBroadcast::Fail(message) => Err(anyhow!("{message}")),
            MockBroadcast::Hang => std::future::pending().await,
        }
    }

    fn signer_address(&self) -> Option<Address> {
        self.state.lock().signer
    }
}

/// Notifier that keeps every message.
#[derive(Default)]
pub struct RecordingNotifier {
    pub messages: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }
}

/// A CFA `FlowUpdated` event.
pub fn flow_updated(
    token: Address,
    sender: Address,
    receiver: Address,
    rate: i64,
    block_number: u64,
    log_index: u64,
) -> FlowEvent {
    FlowEvent::FlowUpdated {
        token,
        sender,
        receiver,
        flow_rate: I256::try_from(rate).unwrap(),
        block_number,
        log_index,
        tx_hash: B256::ZERO,
    }
}
