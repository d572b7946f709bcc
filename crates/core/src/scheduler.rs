//! Liquidation scheduler.
//!
//! Each pass selects accounts whose projected insolvency has passed (shifted
//! by the token's priority delay), confirms on chain that they are still
//! critical, groups them into transactions and hands those to the
//! [`TransactionEngine`] one at a time with locally allocated nonces.

use alloy::primitives::Address;
use anyhow::Result;
use sentinel_chain::{
    encode_batch, encode_cfa_delete, encode_gda_stop, BatchItem, ChainRpc, FlowSource,
    NonceManager, ProtocolAddresses,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::FatalError;
use crate::health::HealthReport;
use crate::model::Task;
use crate::now_secs;
use crate::queue::TaskQueue;
use crate::repository::{Candidate, DueQuery, Repository, TokenFilter};
use crate::shutdown::Shutdown;
use crate::transaction::{TransactionEngine, TxJob, TxOutcome};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Flows per batch call
    pub max_batch_tx: usize,
    pub filter: TokenFilter,
    /// Row cap per pass
    pub limit: Option<usize>,
    pub use_thresholds: bool,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub due: usize,
    pub dropped: usize,
    pub transactions: usize,
    pub confirmed: usize,
}

pub struct Scheduler {
    repo: Arc<dyn Repository>,
    rpc: Arc<dyn ChainRpc>,
    engine: Arc<TransactionEngine>,
    estimations: TaskQueue<Task>,
    addresses: ProtocolAddresses,
    settings: SchedulerSettings,
    shutdown: Shutdown,
    health: Arc<HealthReport>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        rpc: Arc<dyn ChainRpc>,
        engine: Arc<TransactionEngine>,
        estimations: TaskQueue<Task>,
        addresses: ProtocolAddresses,
        settings: SchedulerSettings,
        shutdown: Shutdown,
        health: Arc<HealthReport>,
    ) -> Self {
        Self {
            repo,
            rpc,
            engine,
            estimations,
            addresses,
            settings,
            shutdown,
            health,
        }
    }

    pub async fn run_pass(&self) -> Result<PassReport> {
        self.run_pass_at(now_secs()).await
    }

    #[instrument(skip(self))]
    pub async fn run_pass_at(&self, now: u64) -> Result<PassReport> {
        let signer = self
            .rpc
            .signer_address()
            .ok_or(FatalError::MissingSigner)?;

        let (due, batchable) = self.due_candidates(now).await?;
        let mut report = PassReport {
            due: due.len(),
            ..PassReport::default()
        };
        if due.is_empty() {
            self.health.record_scheduler_pass(now);
            return Ok(report);
        }

        let mut valid = Vec::with_capacity(due.len());
        for candidate in due {
            if self.still_liquidatable(&candidate).await? {
                valid.push(candidate);
            } else {
                debug!(account = %candidate.account, token = %candidate.token, "No longer critical, re-estimating");
                self.estimations
                    .push(Task::estimate(candidate.token, candidate.account, "scheduler"));
                report.dropped += 1;
            }
        }

        let jobs = self.build_jobs(&valid, &batchable);
        if jobs.is_empty() {
            self.health.record_scheduler_pass(now);
            return Ok(report);
        }

        // One nonce read per pass; every job below allocates from it
        let nonces = NonceManager::new(self.rpc.transaction_count(signer).await?);
        info!(
            candidates = valid.len(),
            transactions = jobs.len(),
            nonce = nonces.current(),
            "Sending liquidations"
        );

        for job in &jobs {
            if self.shutdown.is_triggered() {
                break;
            }
            report.transactions += 1;
            let outcome = match self.engine.execute(job, &nonces).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(job = %job.label, error = %format!("{e:#}"), "Liquidation failed");
                    continue;
                }
            };
            if matches!(outcome, TxOutcome::Confirmed { .. }) {
                report.confirmed += 1;
            }
            if outcome.needs_reestimation() {
                for &account in &job.accounts {
                    self.estimations
                        .push(Task::estimate(job.token, account, "liquidation"));
                }
            }
        }

        self.health.record_scheduler_pass(now);
        info!(
            due = report.due,
            dropped = report.dropped,
            transactions = report.transactions,
            confirmed = report.confirmed,
            "Liquidation pass complete"
        );
        Ok(report)
    }

    /// Due rows across tokens in insolvency order, plus the tokens with more
    /// than one due row.
    async fn due_candidates(&self, now: u64) -> Result<(Vec<Candidate>, HashSet<Address>)> {
        let mut due = Vec::new();
        let mut batchable = HashSet::new();

        for token in self.repo.super_tokens().await? {
            if !token.listed || !self.settings.filter.allows(&token.address) {
                continue;
            }
            let query = DueQuery {
                check_time: now.saturating_sub(token.delay_seconds),
                token: Some(token.address),
                filter: self.settings.filter.clone(),
                limit: self.settings.limit,
                use_thresholds: self.settings.use_thresholds,
            };
            due.extend(self.repo.due_liquidations(&query).await?);
            if self.addresses.batch_liquidator.is_some() {
                batchable.extend(self.repo.batchable_token_counts(&query).await?.into_keys());
            }
        }

        due.sort_by(|a, b| {
            a.estimated_insolvency_timestamp
                .cmp(&b.estimated_insolvency_timestamp)
                .then(a.token.cmp(&b.token))
                .then(a.account.cmp(&b.account))
                .then(a.receiver.cmp(&b.receiver))
        });
        if let Some(limit) = self.settings.limit {
            due.truncate(limit);
        }
        Ok((due, batchable))
    }

    async fn still_liquidatable(&self, c: &Candidate) -> Result<bool> {
        if !self
            .rpc
            .flow_exists(c.token, c.source, c.account, c.receiver)
            .await?
        {
            return Ok(false);
        }
        self.rpc.is_critical(c.token, c.account).await
    }

    fn build_jobs(&self, candidates: &[Candidate], batchable: &HashSet<Address>) -> Vec<TxJob> {
        let mut jobs = Vec::new();
        let mut batches: BTreeMap<Address, Vec<&Candidate>> = BTreeMap::new();

        for c in candidates {
            match self.addresses.batch_liquidator {
                Some(_) if batchable.contains(&c.token) => {
                    batches.entry(c.token).or_default().push(c)
                }
                _ => jobs.extend(self.single_job(c)),
            }
        }

        let Some(batch_contract) = self.addresses.batch_liquidator else {
            return jobs;
        };
        for (token, group) in batches {
            if group.len() == 1 {
                jobs.extend(group.first().and_then(|c| self.single_job(c)));
                continue;
            }
            for chunk in group.chunks(self.settings.max_batch_tx.max(1)) {
                let items: Vec<BatchItem> = chunk
                    .iter()
                    .map(|c| BatchItem {
                        source: c.source,
                        sender: c.account,
                        receiver: c.receiver,
                    })
                    .collect();
                jobs.push(TxJob {
                    label: format!("batch of {} on {token}", items.len()),
                    to: batch_contract,
                    data: encode_batch(token, &items),
                    token,
                    accounts: chunk.iter().map(|c| c.account).collect(),
                });
            }
        }
        jobs
    }

    fn single_job(&self, c: &Candidate) -> Option<TxJob> {
        let data = match c.source {
            FlowSource::Cfa => encode_cfa_delete(self.addresses.cfa, c.token, c.account, c.receiver),
            FlowSource::Gda => {
                let Some(gda) = self.addresses.gda else {
                    warn!(account = %c.account, "Distribution flow due but no GDA configured");
                    return None;
                };
                encode_gda_stop(gda, c.token, c.account, c.receiver)
            }
        };
        Some(TxJob {
            label: format!("liquidate {} on {}", c.account, c.token),
            to: self.addresses.host,
            data,
            token: c.token,
            accounts: vec![c.account],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimation::EstimationEngine;
    use crate::model::{agreement_id, Agreement, PriorityMode, SuperToken};
    use crate::queue::RetryPolicy;
    use crate::repository::MemoryRepository;
    use crate::test_support::{MockRpc, RecordingNotifier};
    use crate::transaction::TxSettings;
    use alloy::primitives::I256;
    use sentinel_chain::contracts::IBatchLiquidator;
    use alloy::sol_types::SolCall;
    use std::time::Duration;

    const TOKEN: Address = Address::new([0xaa; 20]);
    const NOW: u64 = 1_700_000_000;

    struct Harness {
        repo: Arc<MemoryRepository>,
        rpc: Arc<MockRpc>,
        engine: EstimationEngine,
        scheduler: Scheduler,
        estimations: TaskQueue<Task>,
    }

    fn addresses(batch: bool) -> ProtocolAddresses {
        ProtocolAddresses {
            host: Address::repeat_byte(0x10),
            cfa: Address::repeat_byte(0x11),
            gda: None,
            toga: None,
            batch_liquidator: batch.then(|| Address::repeat_byte(0x12)),
        }
    }

    async fn harness(batch: bool) -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        repo.upsert_super_token(&SuperToken {
            address: TOKEN,
            symbol: "ETHx".into(),
            name: "Super ETH".into(),
            priority_bond_holder: None,
            priority_mode: PriorityMode::Patrician,
            liquidation_period: 14_400,
            patrician_period: 1_800,
            listed: true,
            delay_seconds: 0,
        })
        .await
        .unwrap();
        let rpc = Arc::new(MockRpc::new(5));
        let shutdown = Shutdown::new();
        let health = Arc::new(HealthReport::new());

        let estimations: TaskQueue<Task> = TaskQueue::new(
            "estimation",
            2,
            RetryPolicy {
                budget: 1,
                base_delay: Duration::from_millis(1),
            },
            Arc::new(EstimationEngine::new(repo.clone(), rpc.clone())),
            shutdown.clone(),
        );
        let tx_engine = Arc::new(TransactionEngine::new(
            rpc.clone(),
            Arc::new(RecordingNotifier::default()),
            shutdown.clone(),
            health.clone(),
            TxSettings {
                max_gas_price: 500_000_000_000,
                multiplier_bps: 11_500,
                broadcast_timeout: Duration::from_secs(60),
                retry_delay: Duration::from_millis(1),
            },
        ));
        let scheduler = Scheduler::new(
            repo.clone(),
            rpc.clone(),
            tx_engine,
            estimations.clone(),
            addresses(batch),
            SchedulerSettings {
                max_batch_tx: 5,
                filter: TokenFilter::default(),
                limit: None,
                use_thresholds: false,
            },
            shutdown,
            health,
        );

        Harness {
            engine: EstimationEngine::new(repo.clone(), rpc.clone()),
            repo,
            rpc,
            scheduler,
            estimations,
        }
    }

    #[tokio::test]
    async fn test_distribution_single_needs_gda() {
        let mut h = harness(false).await;
        let (distributor, pool) = (Address::repeat_byte(1), Address::repeat_byte(0x77));
        let candidate = Candidate {
            account: distributor,
            token: TOKEN,
            source: FlowSource::Gda,
            receiver: pool,
            flow_rate: I256::try_from(-5).unwrap(),
            estimated_insolvency_timestamp: NOW,
        };

        assert!(h.scheduler.single_job(&candidate).is_none());

        let gda = Address::repeat_byte(0x13);
        h.scheduler.addresses.gda = Some(gda);
        let job = h.scheduler.single_job(&candidate).unwrap();
        assert_eq!(job.to, Address::repeat_byte(0x10));
        assert_eq!(job.data, encode_gda_stop(gda, TOKEN, distributor, pool));
        assert_eq!(job.accounts, vec![distributor]);
    }

    /// An open flow from `sender` that drains `balance` at `rate` per second.
    async fn open_flow(h: &Harness, sender: Address, rate: i64, balance: i64) {
        let receiver = Address::repeat_byte(0x99);
        h.repo
            .upsert_agreement(&Agreement {
                agreement_id: agreement_id(TOKEN, sender, receiver),
                super_token: TOKEN,
                sender,
                receiver,
                flow_rate: I256::try_from(rate).unwrap(),
                block_number: 1,
                source: FlowSource::Cfa,
            })
            .await
            .unwrap();
        h.rpc.set_flow(TOKEN, sender, receiver, rate);
        h.rpc.set_account(TOKEN, sender, -rate, balance);
        h.engine.estimate_at(TOKEN, sender, NOW).await.unwrap();
    }

    #[tokio::test]
    async fn test_liquidates_exactly_when_due() {
        let h = harness(false).await;
        let account = Address::repeat_byte(1);
        open_flow(&h, account, 1_000_000, 60_000_000).await;

        let est = h.repo.estimations_for_address(account).await.unwrap();
        assert_eq!(est[0].estimated_insolvency_timestamp, NOW + 60);

        let early = h.scheduler.run_pass_at(NOW + 59).await.unwrap();
        assert_eq!(early.due, 0);
        assert!(h.rpc.sent().is_empty());

        let due = h.scheduler.run_pass_at(NOW + 60).await.unwrap();
        assert_eq!(due.transactions, 1);
        assert_eq!(due.confirmed, 1);
        let sent = h.rpc.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, Address::repeat_byte(0x10));
        assert_eq!(
            sent[0].data,
            encode_cfa_delete(Address::repeat_byte(0x11), TOKEN, account, Address::repeat_byte(0x99))
        );
        h.estimations.drain().await;
    }

    #[tokio::test]
    async fn test_priority_delay_shifts_check_time() {
        let h = harness(false).await;
        let mut token = h.repo.super_token(TOKEN).await.unwrap().unwrap();
        token.delay_seconds = 1_800;
        h.repo.upsert_super_token(&token).await.unwrap();
        open_flow(&h, Address::repeat_byte(1), 1_000_000, 60_000_000).await;

        assert_eq!(h.scheduler.run_pass_at(NOW + 60).await.unwrap().due, 0);
        assert_eq!(h.scheduler.run_pass_at(NOW + 1_860).await.unwrap().due, 1);
    }

    #[tokio::test]
    async fn test_two_due_accounts_share_one_batch() {
        let h = harness(true).await;
        let (a, b) = (Address::repeat_byte(1), Address::repeat_byte(2));
        open_flow(&h, a, 1_000, 0).await;
        open_flow(&h, b, 1_000, 0).await;
        h.rpc.set_tx_count(42);

        let report = h.scheduler.run_pass_at(NOW).await.unwrap();

        assert_eq!(report.due, 2);
        assert_eq!(report.transactions, 1);
        let sent = h.rpc.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, Address::repeat_byte(0x12));
        assert_eq!(sent[0].nonce, 42);
        assert_eq!(&sent[0].data[..4], IBatchLiquidator::deleteFlowsCall::SELECTOR.as_slice());
        h.estimations.drain().await;
    }

    #[tokio::test]
    async fn test_batches_spill_over_max_batch_tx() {
        let h = harness(true).await;
        for b in 1..=7u8 {
            open_flow(&h, Address::repeat_byte(b), 1_000, 0).await;
        }

        let report = h.scheduler.run_pass_at(NOW).await.unwrap();

        assert_eq!(report.transactions, 2);
        let nonces: Vec<u64> = h.rpc.sent().iter().map(|tx| tx.nonce).collect();
        assert_eq!(nonces, vec![0, 1]);
        h.estimations.drain().await;
    }

    #[tokio::test]
    async fn test_recovered_account_is_dropped_and_reestimated() {
        let h = harness(false).await;
        let account = Address::repeat_byte(1);
        open_flow(&h, account, 1_000, 0).await;
        h.rpc.set_not_critical(TOKEN, account);
        // Topped up since the last estimation
        h.rpc.set_account(TOKEN, account, -1_000, 1_000_000_000);

        let report = h.scheduler.run_pass_at(NOW).await.unwrap();

        assert_eq!(report.dropped, 1);
        assert_eq!(report.transactions, 0);
        assert!(h.rpc.sent().is_empty());

        h.estimations.drain().await;
        let est = h.repo.estimations_for_address(account).await.unwrap();
        assert!(est[0].estimated_insolvency_timestamp > NOW + 60);
    }
}
