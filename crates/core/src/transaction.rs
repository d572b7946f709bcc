//! Transaction engine.
//!
//! Drives one liquidation call from gas estimation to a mined receipt:
//! estimate, sign, broadcast under a deadline, and recover from typed node
//! rejections. Each resubmission of the same nonce is priced
//! `base × multiplier^(n−1)`, pinned at the configured ceiling. There is no
//! attempt limit; the loop ends on a receipt, a terminal rejection or
//! shutdown.

use alloy::primitives::{Address, Bytes, B256};
use anyhow::Result;
use sentinel_chain::{CallRequest, ChainRpc, NonceManager, TxError, UnsignedTx};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::error::FatalError;
use crate::health::HealthReport;
use crate::int_math::{gas_limit_with_margin, gas_price_for_attempt};
use crate::notifier::Notifier;
use crate::shutdown::Shutdown;

/// A call to send.
#[derive(Debug, Clone)]
pub struct TxJob {
    /// Short description for logs and notifications
    pub label: String,
    pub to: Address,
    pub data: Bytes,
    pub token: Address,
    /// Senders whose flows this call closes
    pub accounts: Vec<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Confirmed { tx_hash: B256, attempts: u32 },
    /// The flow is already closed or the sender recovered.
    PreconditionChanged,
    AlreadyKnown,
    InsufficientFunds,
    Reverted,
    Cancelled,
}

impl TxOutcome {
    /// Whether the accounts involved should be estimated again.
    pub fn needs_reestimation(&self) -> bool {
        matches!(self, Self::Confirmed { .. } | Self::PreconditionChanged)
    }
}

#[derive(Debug, Clone)]
pub struct TxSettings {
    /// Price ceiling (wei)
    pub max_gas_price: u128,
    /// Per-resubmission price multiplier in basis points
    pub multiplier_bps: u32,
    pub broadcast_timeout: Duration,
    /// Pause before retrying a transient failure
    pub retry_delay: Duration,
}

pub struct TransactionEngine {
    rpc: Arc<dyn ChainRpc>,
    notifier: Arc<dyn Notifier>,
    shutdown: Shutdown,
    health: Arc<HealthReport>,
    settings: TxSettings,
}

impl TransactionEngine {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        notifier: Arc<dyn Notifier>,
        shutdown: Shutdown,
        health: Arc<HealthReport>,
        settings: TxSettings,
    ) -> Self {
        Self {
            rpc,
            notifier,
            shutdown,
            health,
            settings,
        }
    }

    /// Send `job` until it is mined or rejected for good.
    #[instrument(skip(self, job, nonces), fields(job = %job.label, token = %job.token))]
    pub async fn execute(&self, job: &TxJob, nonces: &NonceManager) -> Result<TxOutcome> {
        let from = self
            .rpc
            .signer_address()
            .ok_or(FatalError::MissingSigner)?;

        let call = CallRequest {
            from: Some(from),
            to: job.to,
            data: job.data.clone(),
        };
        let gas_limit = match self.rpc.estimate_gas(&call).await {
            Ok(estimate) => gas_limit_with_margin(estimate),
            Err(e) => {
                return match TxError::from_error(&e) {
                    TxError::FlowDoesNotExist => {
                        info!(accounts = job.accounts.len(), "Simulation says nothing to liquidate");
                        Ok(TxOutcome::PreconditionChanged)
                    }
                    TxError::InsufficientFunds => {
                        self.report_unfunded(from, job).await;
                        Ok(TxOutcome::InsufficientFunds)
                    }
                    TxError::Reverted => {
                        warn!(error = %format!("{e:#}"), "Simulation reverted, dropping job");
                        Ok(TxOutcome::Reverted)
                    }
                    _ => Err(e.context("estimating gas")),
                };
            }
        };

        let base_price = self.rpc.current_gas_price().await?;
        let mut nonce = nonces.next();
        // Set once a send under `nonce` may be sitting in the node's pool
        let mut pooled = false;
        let mut attempt: u32 = 1;
        let mut sends: u32 = 0;
        let mut cap_notified = false;

        loop {
            if self.shutdown.is_triggered() {
                info!(nonce, "Shutdown, abandoning transaction");
                release_unsent(nonces, nonce, pooled);
                return Ok(TxOutcome::Cancelled);
            }

            let (gas_price, capped) = gas_price_for_attempt(
                base_price,
                self.settings.multiplier_bps,
                attempt,
                self.settings.max_gas_price,
            );
            if capped && !cap_notified {
                cap_notified = true;
                warn!(gas_price, attempt, "Gas price pinned at ceiling");
                self.notifier
                    .notify(&format!(
                        "{}: gas price reached the configured maximum of {} wei",
                        job.label, self.settings.max_gas_price
                    ))
                    .await;
            }

            let signed = self
                .rpc
                .sign(&UnsignedTx {
                    to: job.to,
                    data: job.data.clone(),
                    nonce,
                    gas_limit,
                    gas_price,
                })
                .await;
            let raw = match signed {
                Ok(raw) => raw,
                Err(e) => {
                    release_unsent(nonces, nonce, pooled);
                    return Err(e.context("signing transaction"));
                }
            };
            sends += 1;
            self.health.record_liquidation_sent();
            debug!(nonce, gas_price, gas_limit, attempt, "Broadcasting");

            let sent = tokio::time::timeout(self.settings.broadcast_timeout, self.rpc.broadcast(&raw)).await;
            let result = match sent {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        nonce,
                        gas_price,
                        timeout = ?self.settings.broadcast_timeout,
                        "Broadcast timed out, resubmitting with a higher price"
                    );
                    pooled = true;
                    attempt += 1;
                    continue;
                }
            };

            match result {
                Ok(receipt) => {
                    nonces.mark_used(nonce);
                    if receipt.success {
                        self.health.record_liquidation_confirmed();
                        info!(
                            tx_hash = %receipt.tx_hash,
                            block = ?receipt.block_number,
                            accounts = job.accounts.len(),
                            "Liquidation confirmed"
                        );
                        return Ok(TxOutcome::Confirmed {
                            tx_hash: receipt.tx_hash,
                            attempts: sends,
                        });
                    }
                    // Lost the race: someone else closed the flow first
                    warn!(tx_hash = %receipt.tx_hash, "Liquidation mined but reverted");
                    return Ok(TxOutcome::PreconditionChanged);
                }
                Err(e) => match TxError::from_error(&e) {
                    TxError::ReplacementUnderpriced => {
                        debug!(nonce, gas_price, capped, "Replacement underpriced, bumping");
                        pooled = true;
                        attempt += 1;
                        self.pause().await;
                    }
                    TxError::NonceTooLow => {
                        nonces.mark_used(nonce);
                        let next = nonces.next();
                        warn!(stale = nonce, next, "Nonce too low, moving on");
                        nonce = next;
                        pooled = false;
                    }
                    TxError::AlreadyKnown => {
                        info!(nonce, "Transaction already known to the node");
                        return Ok(TxOutcome::AlreadyKnown);
                    }
                    TxError::InsufficientFunds => {
                        release_unsent(nonces, nonce, pooled);
                        self.report_unfunded(from, job).await;
                        return Ok(TxOutcome::InsufficientFunds);
                    }
                    TxError::FlowDoesNotExist => {
                        release_unsent(nonces, nonce, pooled);
                        info!("Flow already closed");
                        return Ok(TxOutcome::PreconditionChanged);
                    }
                    TxError::Reverted => {
                        release_unsent(nonces, nonce, pooled);
                        warn!(error = %format!("{e:#}"), "Liquidation reverted");
                        return Ok(TxOutcome::Reverted);
                    }
                    TxError::Transient => {
                        self.health.record_rpc_error();
                        warn!(error = %format!("{e:#}"), nonce, "Broadcast failed, retrying");
                        self.pause().await;
                    }
                },
            }
        }
    }

    /// Wait `retry_delay` or until shutdown.
    async fn pause(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.retry_delay) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn report_unfunded(&self, from: Address, job: &TxJob) {
        error!(account = %from, job = %job.label, "Operator account cannot pay for gas");
        self.notifier
            .notify(&format!("{}: operator {from} has insufficient funds for gas", job.label))
            .await;
    }
}

/// Hand `nonce` back when the node never took a transaction under it.
fn release_unsent(nonces: &NonceManager, nonce: u64, pooled: bool) {
    if !pooled && nonces.release(nonce) {
        debug!(nonce, "Nonce returned unused");
    }
}
