//! Chain RPC collaborator.
//!
//! [`ChainRpc`] is the only surface the core engine uses to talk to the
//! chain. [`ProviderManager`] implements it with Alloy HTTP providers; tests
//! in the core crate implement it with scripted mocks.

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, B256, I256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::contracts::{
    IConstantFlowAgreementV1, IGeneralDistributionAgreementV1, ISuperToken, ISuperfluid,
    ISuperfluidGovernance, ProtocolAddresses, ITOGA,
};
use crate::errors::TxError;
use crate::events::{flow_filter, parse_flow_event, FlowEvent, FlowSource, LogFilter};
use crate::gas::GasStrategy;
use crate::signer::TransactionSigner;

/// A read-only call used for gas estimation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
}

/// A fully priced transaction ready to be signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub to: Address,
    pub data: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    /// Price in wei; the gas strategy decides which fee fields it fills.
    pub gas_price: u128,
}

/// Outcome of a mined transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReceipt {
    pub tx_hash: B256,
    pub block_number: Option<u64>,
    pub success: bool,
}

/// Token metadata read once when a token is first discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub symbol: String,
    pub name: String,
    pub liquidation_period: u64,
    pub patrician_period: u64,
}

/// Priority-bond state of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityInfo {
    /// Current bond holder, `None` when no TOGA is deployed.
    pub pic: Option<Address>,
    /// Protocol reward address for this token.
    pub reward_address: Address,
    pub liquidation_period: u64,
    pub patrician_period: u64,
}

/// Everything the engine needs from the chain.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    /// Head minus `offset` confirmations, saturating at zero.
    async fn current_block_number(&self, offset: u64) -> Result<u64>;

    /// Decoded agreement events of one family in `[from_block, to_block]`.
    async fn get_logs(
        &self,
        source: FlowSource,
        from_block: u64,
        to_block: u64,
        filter: Option<&LogFilter>,
    ) -> Result<Vec<FlowEvent>>;

    /// Sum of CFA and GDA net flow rates.
    async fn net_flow_rate(&self, token: Address, account: Address) -> Result<I256>;

    /// Available balance now, including accrued flow.
    async fn realtime_balance(&self, token: Address, account: Address) -> Result<I256>;

    /// Current on-chain rate of one flow.
    async fn flow_rate(
        &self,
        token: Address,
        source: FlowSource,
        sender: Address,
        receiver: Address,
    ) -> Result<I256>;

    async fn flow_exists(
        &self,
        token: Address,
        source: FlowSource,
        sender: Address,
        receiver: Address,
    ) -> Result<bool> {
        Ok(!self.flow_rate(token, source, sender, receiver).await?.is_zero())
    }

    async fn is_critical(&self, token: Address, account: Address) -> Result<bool>;

    async fn token_info(&self, token: Address) -> Result<TokenInfo>;

    async fn priority_info(&self, token: Address) -> Result<PriorityInfo>;

    /// Next nonce including transactions still in the pool.
    async fn transaction_count(&self, account: Address) -> Result<u64>;

    async fn native_balance(&self, account: Address) -> Result<U256>;

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64>;

    async fn current_gas_price(&self) -> Result<u128>;

    async fn sign(&self, tx: &UnsignedTx) -> Result<Bytes>;

    /// Send a signed transaction and wait for its receipt.
    async fn broadcast(&self, raw: &Bytes) -> Result<BroadcastReceipt>;

    /// Operator address, `None` in observer mode.
    fn signer_address(&self) -> Option<Address>;
}

/// Alloy-backed [`ChainRpc`].
pub struct ProviderManager {
    /// HTTP URL for reads
    http_url: String,
    /// HTTP URL for sends (may differ from reads)
    send_url: String,
    addresses: ProtocolAddresses,
    /// Resolved once from the host
    governance: Address,
    signer: Option<TransactionSigner>,
    gas_strategy: Arc<dyn GasStrategy>,
    call_timeout: Duration,
}

impl ProviderManager {
    /// Connect, verify the endpoint and resolve the governance contract.
    pub async fn new(
        http_url: &str,
        send_url: Option<&str>,
        addresses: ProtocolAddresses,
        signer: Option<TransactionSigner>,
        gas_strategy: Arc<dyn GasStrategy>,
        call_timeout: Duration,
    ) -> Result<Self> {
        let send_url = send_url.unwrap_or(http_url);
        info!(
            http = http_url,
            send = send_url,
            host = %addresses.host,
            cfa = %addresses.cfa,
            gda = ?addresses.gda,
            gas_strategy = gas_strategy.strategy_name(),
            "Initializing provider manager"
        );

        let provider = ProviderBuilder::new().on_http(http_url.parse()?);
        let block = provider
            .get_block_number()
            .await
            .context("RPC endpoint unreachable")?;

        let host = ISuperfluid::new(addresses.host, &provider);
        let governance = host
            .getGovernance()
            .call()
            .await
            .context("failed to resolve governance from host")?
            .governance;

        info!(block, governance = %governance, "Provider connection verified");

        Ok(Self {
            http_url: http_url.to_string(),
            send_url: send_url.to_string(),
            addresses,
            governance,
            signer,
            gas_strategy,
            call_timeout,
        })
    }

    pub fn addresses(&self) -> &ProtocolAddresses {
        &self.addresses
    }

    pub fn http_url(&self) -> &str {
        &self.http_url
    }

    fn agreement(&self, source: FlowSource) -> Option<Address> {
        match source {
            FlowSource::Cfa => Some(self.addresses.cfa),
            FlowSource::Gda => self.addresses.gda,
        }
    }

    /// Race a call against the configured timeout.
    async fn timed<T, F>(&self, what: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.with_context(|| format!("{what} failed")),
            Err(_) => Err(anyhow!("{what} timed out after {:?}", self.call_timeout)),
        }
    }
}

#[async_trait]
impl ChainRpc for ProviderManager {
    async fn chain_id(&self) -> Result<u64> {
        self.timed("eth_chainId", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            Ok(provider.get_chain_id().await?)
        })
        .await
    }

    async fn current_block_number(&self, offset: u64) -> Result<u64> {
        self.timed("eth_blockNumber", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            let head = provider.get_block_number().await?;
            Ok(head.saturating_sub(offset))
        })
        .await
    }

    async fn get_logs(
        &self,
        source: FlowSource,
        from_block: u64,
        to_block: u64,
        filter: Option<&LogFilter>,
    ) -> Result<Vec<FlowEvent>> {
        let Some(agreement) = self.agreement(source) else {
            return Ok(Vec::new());
        };
        let query = flow_filter(source, agreement, from_block, to_block, filter);

        self.timed("eth_getLogs", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            let logs = provider.get_logs(&query).await?;
            let events: Vec<FlowEvent> = logs.iter().filter_map(parse_flow_event).collect();
            debug!(
                source = %source,
                from_block,
                to_block,
                logs = logs.len(),
                events = events.len(),
                "Fetched agreement logs"
            );
            Ok(events)
        })
        .await
    }

    async fn net_flow_rate(&self, token: Address, account: Address) -> Result<I256> {
        self.timed("getNetFlow", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            let cfa = IConstantFlowAgreementV1::new(self.addresses.cfa, &provider);
            let cfa_call = cfa.getNetFlow(token, account);

            match self.addresses.gda {
                Some(gda) => {
                    let gda = IGeneralDistributionAgreementV1::new(gda, &provider);
                    let gda_call = gda.getNetFlow(token, account);
                    let (cfa_rate, gda_rate) = tokio::join!(cfa_call.call(), gda_call.call());
                    Ok(cfa_rate?.flowRate.saturating_add(gda_rate?.flowRate))
                }
                None => Ok(cfa_call.call().await?.flowRate),
            }
        })
        .await
    }

    async fn realtime_balance(&self, token: Address, account: Address) -> Result<I256> {
        self.timed("realtimeBalanceOfNow", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            let super_token = ISuperToken::new(token, &provider);
            Ok(super_token
                .realtimeBalanceOfNow(account)
                .call()
                .await?
                .availableBalance)
        })
        .await
    }

    async fn flow_rate(
        &self,
        token: Address,
        source: FlowSource,
        sender: Address,
        receiver: Address,
    ) -> Result<I256> {
        let Some(agreement) = self.agreement(source) else {
            return Ok(I256::ZERO);
        };

        self.timed("flow rate", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            let rate = match source {
                FlowSource::Cfa => {
                    IConstantFlowAgreementV1::new(agreement, &provider)
                        .getFlow(token, sender, receiver)
                        .call()
                        .await?
                        .flowRate
                }
                FlowSource::Gda => {
                    IGeneralDistributionAgreementV1::new(agreement, &provider)
                        .getFlowRate(token, sender, receiver)
                        .call()
                        .await?
                        .flowRate
                }
            };
            Ok(rate)
        })
        .await
    }

    async fn is_critical(&self, token: Address, account: Address) -> Result<bool> {
        self.timed("isAccountCriticalNow", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            Ok(ISuperToken::new(token, &provider)
                .isAccountCriticalNow(account)
                .call()
                .await?
                .isCritical)
        })
        .await
    }

    async fn token_info(&self, token: Address) -> Result<TokenInfo> {
        self.timed("token info", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            let super_token = ISuperToken::new(token, &provider);
            let governance = ISuperfluidGovernance::new(self.governance, &provider);

            let symbol_call = super_token.symbol();
            let name_call = super_token.name();
            let ppp_call = governance.getPPPConfig(self.addresses.host, token);
            let (symbol, name, ppp) =
                tokio::join!(symbol_call.call(), name_call.call(), ppp_call.call());

            // Some tokens revert on metadata; the periods are what matter
            let symbol = symbol.map(|r| r.symbol).unwrap_or_else(|e| {
                warn!(token = %token, error = %e, "symbol() failed");
                String::new()
            });
            let name = name.map(|r| r.name).unwrap_or_default();
            let ppp = ppp?;

            Ok(TokenInfo {
                symbol,
                name,
                liquidation_period: ppp.liquidationPeriod.saturating_to::<u64>(),
                patrician_period: ppp.patricianPeriod.saturating_to::<u64>(),
            })
        })
        .await
    }

    async fn priority_info(&self, token: Address) -> Result<PriorityInfo> {
        self.timed("priority info", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            let governance = ISuperfluidGovernance::new(self.governance, &provider);

            let ppp_call = governance.getPPPConfig(self.addresses.host, token);
            let reward_call = governance.getRewardAddress(self.addresses.host, token);
            let (ppp, reward) = tokio::join!(ppp_call.call(), reward_call.call());
            let ppp = ppp?;

            let pic = match self.addresses.toga {
                Some(toga) => Some(
                    ITOGA::new(toga, &provider)
                        .getCurrentPIC(token)
                        .call()
                        .await?
                        .pic,
                ),
                None => None,
            };

            Ok(PriorityInfo {
                pic,
                reward_address: reward?.rewardAddress,
                liquidation_period: ppp.liquidationPeriod.saturating_to::<u64>(),
                patrician_period: ppp.patricianPeriod.saturating_to::<u64>(),
            })
        })
        .await
    }

    async fn transaction_count(&self, account: Address) -> Result<u64> {
        self.timed("eth_getTransactionCount", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            Ok(provider.get_transaction_count(account).pending().await?)
        })
        .await
    }

    async fn native_balance(&self, account: Address) -> Result<U256> {
        self.timed("eth_getBalance", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            Ok(provider.get_balance(account).await?)
        })
        .await
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64> {
        let mut tx = TransactionRequest::default()
            .with_to(call.to)
            .with_input(call.data.clone());
        if let Some(from) = call.from.or_else(|| self.signer_address()) {
            tx = tx.with_from(from);
        }

        self.timed("eth_estimateGas", async {
            let provider = ProviderBuilder::new().on_http(self.http_url.parse()?);
            Ok(provider.estimate_gas(tx).await?)
        })
        .await
    }

    async fn current_gas_price(&self) -> Result<u128> {
        self.timed("gas price", self.gas_strategy.fetch_base_price(&self.http_url))
            .await
    }

    async fn sign(&self, tx: &UnsignedTx) -> Result<Bytes> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| anyhow!("no signing key configured"))?;
        signer.sign(tx).await
    }

    async fn broadcast(&self, raw: &Bytes) -> Result<BroadcastReceipt> {
        // No timeout here: the transaction engine owns the broadcast deadline
        let provider = ProviderBuilder::new().on_http(self.send_url.parse()?);
        let pending = provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| anyhow::Error::new(TxError::classify(&e.to_string())).context(e.to_string()))?;

        let tx_hash = *pending.tx_hash();
        debug!(tx_hash = %tx_hash, "Transaction accepted by node");

        let receipt = pending.get_receipt().await?;
        Ok(BroadcastReceipt {
            tx_hash,
            block_number: receipt.block_number,
            success: receipt.status(),
        })
    }

    fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address)
    }
}
