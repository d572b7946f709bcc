//! Repository contract and the in-memory engine.
//!
//! One repository instance is built at startup and shared as
//! `Arc<dyn Repository>` by every component. [`MemoryRepository`] keeps
//! everything in concurrent maps and can mirror itself into a JSON snapshot
//! so a restart resumes from the last checkpoint.

use alloy::primitives::{Address, B256, I256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use sentinel_chain::FlowSource;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::model::{
    AccountEstimation, Agreement, FlowDistribution, SuperToken, SystemCheckpoint, Threshold,
};

/// Include/exclude token lists. A non-empty include list wins over exclude.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenFilter {
    pub include: Vec<Address>,
    pub exclude: Vec<Address>,
}

impl TokenFilter {
    pub fn allows(&self, token: &Address) -> bool {
        if !self.include.is_empty() {
            return self.include.contains(token);
        }
        !self.exclude.contains(token)
    }
}

/// Selection of liquidation candidates.
#[derive(Debug, Clone, Default)]
pub struct DueQuery {
    /// Only estimations with `0 < timestamp <= check_time`
    pub check_time: u64,
    /// Restrict to one token
    pub token: Option<Address>,
    pub filter: TokenFilter,
    pub limit: Option<usize>,
    /// Skip flows below the token's minimum rate
    pub use_thresholds: bool,
}

/// One open flow whose sender is due for liquidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub account: Address,
    pub token: Address,
    pub source: FlowSource,
    /// CFA receiver or GDA pool
    pub receiver: Address,
    pub flow_rate: I256,
    pub estimated_insolvency_timestamp: u64,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // Queries

    /// Distinct `(token, sender)` pairs with an open flow touched at or after `from_block`.
    async fn accounts_with_open_flows(&self, from_block: u64) -> Result<Vec<(Address, Address)>>;

    async fn estimations(&self) -> Result<Vec<AccountEstimation>>;

    async fn estimations_for_address(&self, address: Address) -> Result<Vec<AccountEstimation>>;

    /// Due candidates ascending by insolvency timestamp.
    async fn due_liquidations(&self, query: &DueQuery) -> Result<Vec<Candidate>>;

    /// Number of due candidates per token, for tokens with more than one.
    async fn batchable_token_counts(&self, query: &DueQuery) -> Result<BTreeMap<Address, usize>>;

    // Agreements

    /// Insert a history row keyed by `(block, log_index)`. Returns false on duplicates.
    async fn create_agreement_event(&self, log_index: u64, agreement: &Agreement) -> Result<bool>;

    /// Replace the latest-state row unless the stored one is from a later block.
    async fn upsert_agreement(&self, agreement: &Agreement) -> Result<bool>;

    async fn agreement(&self, id: B256) -> Result<Option<Agreement>>;

    async fn create_distribution_event(
        &self,
        log_index: u64,
        distribution: &FlowDistribution,
    ) -> Result<bool>;

    async fn upsert_distribution(&self, distribution: &FlowDistribution) -> Result<bool>;

    // Estimations

    async fn upsert_estimation(&self, estimation: &AccountEstimation) -> Result<()>;

    async fn destroy_estimation(&self, address: Address, token: Address) -> Result<bool>;

    // Tokens

    async fn super_token(&self, address: Address) -> Result<Option<SuperToken>>;

    async fn super_tokens(&self) -> Result<Vec<SuperToken>>;

    async fn upsert_super_token(&self, token: &SuperToken) -> Result<()>;

    async fn threshold(&self, token: Address) -> Result<Option<Threshold>>;

    async fn upsert_threshold(&self, threshold: &Threshold) -> Result<()>;

    // Checkpoint

    async fn checkpoint(&self) -> Result<Option<SystemCheckpoint>>;

    /// Persist the checkpoint; this is the durability point.
    async fn upsert_checkpoint(&self, checkpoint: &SystemCheckpoint) -> Result<()>;
}

/// On-disk image of a [`MemoryRepository`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    checkpoint: Option<SystemCheckpoint>,
    tokens: Vec<SuperToken>,
    thresholds: Vec<Threshold>,
    agreements: Vec<Agreement>,
    agreement_history: Vec<(u64, Agreement)>,
    distributions: Vec<FlowDistribution>,
    distribution_history: Vec<(u64, FlowDistribution)>,
    estimations: Vec<AccountEstimation>,
}

/// Concurrent in-memory repository with optional JSON snapshot.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    agreements: DashMap<B256, Agreement>,
    /// (block, log_index) → row
    agreement_history: DashMap<(u64, u64), Agreement>,
    distributions: DashMap<B256, FlowDistribution>,
    distribution_history: DashMap<(u64, u64), FlowDistribution>,
    /// (address, token) → estimation
    estimations: DashMap<(Address, Address), AccountEstimation>,
    tokens: DashMap<Address, SuperToken>,
    thresholds: DashMap<Address, Threshold>,
    checkpoint: RwLock<Option<SystemCheckpoint>>,
    snapshot_path: Option<PathBuf>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a snapshot-backed repository, loading the file if it exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut repo = Self {
            snapshot_path: Some(path.clone()),
            ..Self::default()
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt snapshot {}", path.display()))?;
                repo.restore(snapshot);
                info!(
                    path = %path.display(),
                    agreements = repo.agreements.len(),
                    estimations = repo.estimations.len(),
                    tokens = repo.tokens.len(),
                    "Repository snapshot loaded"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No snapshot found, starting empty");
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        }

        Ok(repo)
    }

    fn restore(&mut self, snapshot: Snapshot) {
        *self.checkpoint.get_mut() = snapshot.checkpoint;
        for t in snapshot.tokens {
            self.tokens.insert(t.address, t);
        }
        for t in snapshot.thresholds {
            self.thresholds.insert(t.token, t);
        }
        for a in snapshot.agreements {
            self.agreements.insert(a.agreement_id, a);
        }
        for (log_index, a) in snapshot.agreement_history {
            self.agreement_history.insert((a.block_number, log_index), a);
        }
        for d in snapshot.distributions {
            self.distributions.insert(d.agreement_id, d);
        }
        for (log_index, d) in snapshot.distribution_history {
            self.distribution_history.insert((d.block_number, log_index), d);
        }
        for e in snapshot.estimations {
            self.estimations.insert((e.address, e.super_token), e);
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            checkpoint: *self.checkpoint.read(),
            tokens: self.tokens.iter().map(|r| r.value().clone()).collect(),
            thresholds: self.thresholds.iter().map(|r| *r.value()).collect(),
            agreements: self.agreements.iter().map(|r| r.value().clone()).collect(),
            agreement_history: self
                .agreement_history
                .iter()
                .map(|r| (r.key().1, r.value().clone()))
                .collect(),
            distributions: self.distributions.iter().map(|r| r.value().clone()).collect(),
            distribution_history: self
                .distribution_history
                .iter()
                .map(|r| (r.key().1, r.value().clone()))
                .collect(),
            estimations: self.estimations.iter().map(|r| r.value().clone()).collect(),
        }
    }

    /// Write the snapshot next to its target and rename over it.
    async fn flush(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let bytes = serde_json::to_vec(&self.snapshot())?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming snapshot to {}", path.display()))?;

        debug!(path = %path.display(), bytes = bytes.len(), "Snapshot flushed");
        Ok(())
    }

    /// Number of latest-state agreement rows.
    pub fn agreement_count(&self) -> usize {
        self.agreements.len()
    }

    /// Number of agreement history rows.
    pub fn history_count(&self) -> usize {
        self.agreement_history.len()
    }

    fn collect_candidates(&self, query: &DueQuery) -> Vec<Candidate> {
        let mut open_by_sender: HashMap<(Address, Address), Vec<Agreement>> = HashMap::new();
        for entry in self.agreements.iter() {
            let a = entry.value();
            if a.is_open() {
                open_by_sender
                    .entry((a.super_token, a.sender))
                    .or_default()
                    .push(a.clone());
            }
        }

        let mut candidates = Vec::new();
        for entry in self.estimations.iter() {
            let est = entry.value();
            let ts = est.estimated_insolvency_timestamp;
            if ts == 0 || ts > query.check_time {
                continue;
            }
            if query.token.is_some_and(|t| t != est.super_token) {
                continue;
            }
            if !query.filter.allows(&est.super_token) {
                continue;
            }
            if self
                .tokens
                .get(&est.super_token)
                .is_some_and(|t| !t.listed)
            {
                continue;
            }

            let minimum = if query.use_thresholds {
                self.thresholds
                    .get(&est.super_token)
                    .map(|t| t.minimum_flow_rate.unsigned_abs())
            } else {
                None
            };

            let Some(flows) = open_by_sender.get(&(est.super_token, est.address)) else {
                continue;
            };
            for flow in flows {
                if minimum.is_some_and(|min| flow.flow_rate.unsigned_abs() < min) {
                    continue;
                }
                candidates.push(Candidate {
                    account: est.address,
                    token: est.super_token,
                    source: flow.source,
                    receiver: flow.receiver,
                    flow_rate: flow.flow_rate,
                    estimated_insolvency_timestamp: ts,
                });
            }
        }

        candidates.sort_by(|a, b| {
            a.estimated_insolvency_timestamp
                .cmp(&b.estimated_insolvency_timestamp)
                .then(a.token.cmp(&b.token))
                .then(a.account.cmp(&b.account))
                .then(a.receiver.cmp(&b.receiver))
        });
        if let Some(limit) = query.limit {
            candidates.truncate(limit);
        }
        candidates
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn accounts_with_open_flows(&self, from_block: u64) -> Result<Vec<(Address, Address)>> {
        let pairs: HashSet<(Address, Address)> = self
            .agreements
            .iter()
            .filter(|r| r.is_open() && r.block_number >= from_block)
            .map(|r| (r.super_token, r.sender))
            .collect();
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort();
        Ok(pairs)
    }

    async fn estimations(&self) -> Result<Vec<AccountEstimation>> {
        Ok(self.estimations.iter().map(|r| r.value().clone()).collect())
    }

    async fn estimations_for_address(&self, address: Address) -> Result<Vec<AccountEstimation>> {
        Ok(self
            .estimations
            .iter()
            .filter(|r| r.key().0 == address)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn due_liquidations(&self, query: &DueQuery) -> Result<Vec<Candidate>> {
        Ok(self.collect_candidates(query))
    }

    async fn batchable_token_counts(&self, query: &DueQuery) -> Result<BTreeMap<Address, usize>> {
        let mut counts: BTreeMap<Address, usize> = BTreeMap::new();
        for candidate in self.collect_candidates(query) {
            *counts.entry(candidate.token).or_default() += 1;
        }
        counts.retain(|_, n| *n > 1);
        Ok(counts)
    }

    async fn create_agreement_event(&self, log_index: u64, agreement: &Agreement) -> Result<bool> {
        match self.agreement_history.entry((agreement.block_number, log_index)) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(agreement.clone());
                Ok(true)
            }
        }
    }

    async fn upsert_agreement(&self, agreement: &Agreement) -> Result<bool> {
        match self.agreements.entry(agreement.agreement_id) {
            Entry::Occupied(mut slot) => {
                if agreement.block_number >= slot.get().block_number {
                    slot.insert(agreement.clone());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(agreement.clone());
                Ok(true)
            }
        }
    }

    async fn agreement(&self, id: B256) -> Result<Option<Agreement>> {
        Ok(self.agreements.get(&id).map(|r| r.value().clone()))
    }

    async fn create_distribution_event(
        &self,
        log_index: u64,
        distribution: &FlowDistribution,
    ) -> Result<bool> {
        match self
            .distribution_history
            .entry((distribution.block_number, log_index))
        {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(distribution.clone());
                Ok(true)
            }
        }
    }

    async fn upsert_distribution(&self, distribution: &FlowDistribution) -> Result<bool> {
        match self.distributions.entry(distribution.agreement_id) {
            Entry::Occupied(mut slot) => {
                if distribution.block_number >= slot.get().block_number {
                    slot.insert(distribution.clone());
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(distribution.clone());
                Ok(true)
            }
        }
    }

    async fn upsert_estimation(&self, estimation: &AccountEstimation) -> Result<()> {
        self.estimations
            .insert((estimation.address, estimation.super_token), estimation.clone());
        Ok(())
    }

    async fn destroy_estimation(&self, address: Address, token: Address) -> Result<bool> {
        Ok(self.estimations.remove(&(address, token)).is_some())
    }

    async fn super_token(&self, address: Address) -> Result<Option<SuperToken>> {
        Ok(self.tokens.get(&address).map(|r| r.value().clone()))
    }

    async fn super_tokens(&self) -> Result<Vec<SuperToken>> {
        let mut tokens: Vec<SuperToken> = self.tokens.iter().map(|r| r.value().clone()).collect();
        tokens.sort_by_key(|t| t.address);
        Ok(tokens)
    }

    async fn upsert_super_token(&self, token: &SuperToken) -> Result<()> {
        self.tokens.insert(token.address, token.clone());
        Ok(())
    }

    async fn threshold(&self, token: Address) -> Result<Option<Threshold>> {
        Ok(self.thresholds.get(&token).map(|r| *r.value()))
    }

    async fn upsert_threshold(&self, threshold: &Threshold) -> Result<()> {
        self.thresholds.insert(threshold.token, *threshold);
        Ok(())
    }

    async fn checkpoint(&self) -> Result<Option<SystemCheckpoint>> {
        Ok(*self.checkpoint.read())
    }

    async fn upsert_checkpoint(&self, checkpoint: &SystemCheckpoint) -> Result<()> {
        *self.checkpoint.write() = Some(*checkpoint);
        self.flush().await
    }
}
