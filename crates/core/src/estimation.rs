//! Insolvency estimation and the agreement-update fan-out.

use alloy::primitives::Address;
use anyhow::Result;
use async_trait::async_trait;
use sentinel_chain::{ChainRpc, FlowSource};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::int_math::insolvency_timestamp;
use crate::model::{agreement_id, AccountEstimation, Agreement, AgreementTask, Task};
use crate::now_secs;
use crate::queue::{TaskHandler, TaskQueue};
use crate::repository::Repository;

/// Projects when an account's available balance reaches zero.
pub struct EstimationEngine {
    repo: Arc<dyn Repository>,
    rpc: Arc<dyn ChainRpc>,
}

impl EstimationEngine {
    pub fn new(repo: Arc<dyn Repository>, rpc: Arc<dyn ChainRpc>) -> Self {
        Self { repo, rpc }
    }

    /// Estimate and persist. `None` when the account or token is skipped.
    pub async fn estimate(&self, token: Address, account: Address) -> Result<Option<AccountEstimation>> {
        self.estimate_at(token, account, now_secs()).await
    }

    #[instrument(skip(self), fields(token = %token, account = %account))]
    pub async fn estimate_at(
        &self,
        token: Address,
        account: Address,
        now: u64,
    ) -> Result<Option<AccountEstimation>> {
        if account == Address::ZERO {
            return Ok(None);
        }
        if self.repo.super_token(token).await?.is_none() {
            info!("Token not registered, skipping estimation");
            return Ok(None);
        }

        let (net_flow_rate, balance) = tokio::try_join!(
            self.rpc.net_flow_rate(token, account),
            self.rpc.realtime_balance(token, account)
        )?;

        let estimation = AccountEstimation {
            address: account,
            super_token: token,
            net_flow_rate,
            balance,
            estimated_insolvency_timestamp: insolvency_timestamp(now, net_flow_rate, balance),
            last_checked_at: now,
            recalculate: false,
        };
        self.repo.upsert_estimation(&estimation).await?;

        debug!(
            net_flow_rate = %net_flow_rate,
            balance = %balance,
            insolvent_at = estimation.estimated_insolvency_timestamp,
            "Estimation updated"
        );
        Ok(Some(estimation))
    }
}

#[async_trait]
impl TaskHandler<Task> for EstimationEngine {
    async fn handle(&self, task: &Task) -> Result<()> {
        self.estimate(task.token, task.account).await.map(|_| ())
    }
}

/// Re-reads one flow on chain, stores it, and queues estimations for both ends.
pub struct AgreementUpdater {
    repo: Arc<dyn Repository>,
    rpc: Arc<dyn ChainRpc>,
    estimations: TaskQueue<Task>,
}

impl AgreementUpdater {
    pub fn new(repo: Arc<dyn Repository>, rpc: Arc<dyn ChainRpc>, estimations: TaskQueue<Task>) -> Self {
        Self {
            repo,
            rpc,
            estimations,
        }
    }
}

#[async_trait]
impl TaskHandler<AgreementTask> for AgreementUpdater {
    async fn handle(&self, task: &AgreementTask) -> Result<()> {
        let flow_rate = self
            .rpc
            .flow_rate(task.token, task.source, task.sender, task.receiver)
            .await?;

        let agreement = Agreement {
            agreement_id: agreement_id(task.token, task.sender, task.receiver),
            super_token: task.token,
            sender: task.sender,
            receiver: task.receiver,
            flow_rate,
            block_number: task.block_number,
            source: task.source,
        };
        self.repo.upsert_agreement(&agreement).await?;

        let mut accounts = vec![task.sender];
        // Pools are not accounts with their own balance
        if task.source == FlowSource::Cfa {
            accounts.push(task.receiver);
        }
        for account in accounts {
            self.flag_stale(task.token, account).await?;
            self.estimations
                .push(Task::estimate(task.token, account, "agreement"));
        }
        Ok(())
    }
}

impl AgreementUpdater {
    /// Mark a stored estimation as outdated until the engine rewrites it.
    async fn flag_stale(&self, token: Address, account: Address) -> Result<()> {
        let stored = self
            .repo
            .estimations_for_address(account)
            .await?
            .into_iter()
            .find(|e| e.super_token == token);
        if let Some(mut estimation) = stored.filter(|e| !e.recalculate) {
            estimation.recalculate = true;
            self.repo.upsert_estimation(&estimation).await?;
        }
        Ok(())
    }
}
