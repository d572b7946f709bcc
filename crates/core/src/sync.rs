//! Chain sync engine.
//!
//! Replays agreement events from the durable watermark up to the confirmed
//! head in fixed-size block windows, keeps the latest state of every flow,
//! registers newly seen tokens and advances the checkpoint only after every
//! window succeeded. Re-running over an already scanned range is harmless:
//! history rows are keyed by `(block, log_index)` and latest-state rows only
//! move forward.

use alloy::primitives::Address;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use sentinel_chain::{ChainRpc, FlowSource};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::FatalError;
use crate::health::HealthReport;
use crate::model::{AgreementTask, NormalizedEvent, PriorityMode, SuperToken, SystemCheckpoint, Task};
use crate::now_secs;
use crate::priority::PriorityResolver;
use crate::queue::{RetryPolicy, TaskHandler, TaskQueue};
use crate::repository::Repository;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Full replay; estimations are rebuilt afterwards in one sweep.
    Bootstrap,
    /// Incremental; every event queues an agreement update.
    Live,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub epoch_block: u64,
    pub max_query_block_range: u64,
    pub block_offset: u64,
    pub observer: bool,
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

/// What one run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub from_block: u64,
    pub to_block: u64,
    pub windows: usize,
    pub events: usize,
    pub new_tokens: usize,
}

pub struct SyncEngine {
    repo: Arc<dyn Repository>,
    rpc: Arc<dyn ChainRpc>,
    resolver: Arc<PriorityResolver>,
    settings: SyncSettings,
    shutdown: Shutdown,
    health: Arc<HealthReport>,
    agreements: Option<TaskQueue<AgreementTask>>,
}

impl SyncEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        rpc: Arc<dyn ChainRpc>,
        resolver: Arc<PriorityResolver>,
        settings: SyncSettings,
        shutdown: Shutdown,
        health: Arc<HealthReport>,
    ) -> Self {
        Self {
            repo,
            rpc,
            resolver,
            settings,
            shutdown,
            health,
            agreements: None,
        }
    }

    /// Queue that receives one task per event in live mode.
    pub fn with_agreement_queue(mut self, agreements: TaskQueue<AgreementTask>) -> Self {
        self.agreements = Some(agreements);
        self
    }

    /// Scan from the checkpoint to the confirmed head.
    #[instrument(skip(self))]
    pub async fn run(&self, mode: SyncMode) -> Result<SyncReport> {
        let chain_id = self.rpc.chain_id().await.context("reading chain id")?;
        let previous = self.repo.checkpoint().await?;

        if let Some(cp) = previous {
            if cp.chain_id != chain_id {
                let fatal = FatalError::ChainIdMismatch {
                    expected: cp.chain_id,
                    actual: chain_id,
                };
                self.shutdown.trigger_fatal(fatal.clone());
                return Err(fatal.into());
            }
        }

        let last = previous.map_or(0, |cp| cp.last_event_scan_block);
        let low = last.max(self.settings.epoch_block);
        let high = self
            .rpc
            .current_block_number(self.settings.block_offset)
            .await
            .context("reading head block")?;

        if high < low {
            debug!(low, high, "Nothing to scan yet");
            self.health.record_sync(last, now_secs());
            return Ok(SyncReport {
                from_block: low,
                to_block: high,
                ..SyncReport::default()
            });
        }

        let scanner = Arc::new(WindowScanner {
            repo: self.repo.clone(),
            rpc: self.rpc.clone(),
            mode,
            touched: DashSet::new(),
            events: AtomicUsize::new(0),
            updates: Mutex::new(Vec::new()),
        });
        let windows: TaskQueue<Task> = TaskQueue::new(
            "sync",
            self.settings.concurrency,
            self.settings.retry,
            scanner.clone(),
            self.shutdown.clone(),
        );

        let ranges = block_windows(low, high, self.settings.max_query_block_range);
        info!(mode = ?mode, from = low, to = high, windows = ranges.len(), "Scanning agreement events");
        for &(from, to) in &ranges {
            windows.push(Task::window(from, to));
        }
        windows.drain().await;
        self.check_interrupted("sync")?;

        let mut touched: Vec<Address> = scanner.touched.iter().map(|t| *t).collect();
        touched.sort();
        let new_tokens = self.register_tokens(&touched).await?;

        if let Some(agreements) = &self.agreements {
            // The rescanned watermark block was fanned out by the run that set it
            let seen_through = previous.map(|cp| cp.last_event_scan_block);
            for update in scanner.updates.lock().drain(..) {
                if seen_through.is_some_and(|block| update.block_number <= block) {
                    continue;
                }
                agreements.push(update);
            }
        }

        let checkpoint = SystemCheckpoint {
            chain_id,
            last_event_scan_block: last.max(high),
            last_bootstrap_block: previous.and_then(|cp| cp.last_bootstrap_block),
        };
        self.repo.upsert_checkpoint(&checkpoint).await?;

        if !self.settings.observer {
            self.resolve_priorities().await?;
        }

        self.health.record_sync(checkpoint.last_event_scan_block, now_secs());
        let report = SyncReport {
            from_block: low,
            to_block: high,
            windows: ranges.len(),
            events: scanner.events.load(Ordering::Relaxed),
            new_tokens,
        };
        info!(
            to_block = report.to_block,
            events = report.events,
            new_tokens = report.new_tokens,
            "Sync complete"
        );
        Ok(report)
    }

    /// First-run bootstrap: full scan, drop stale estimations, then estimate
    /// every account with an open outgoing flow.
    pub async fn reconcile(&self, estimations: &TaskQueue<Task>) -> Result<SyncReport> {
        let report = self.run(SyncMode::Bootstrap).await?;

        let open: HashSet<(Address, Address)> =
            self.repo.accounts_with_open_flows(0).await?.into_iter().collect();

        let mut removed = 0usize;
        for est in self.repo.estimations().await? {
            if !open.contains(&(est.super_token, est.address))
                && self.repo.destroy_estimation(est.address, est.super_token).await?
            {
                removed += 1;
            }
        }

        for &(token, account) in &open {
            estimations.push(Task::estimate(token, account, "bootstrap"));
        }
        info!(accounts = open.len(), removed, "Estimating accounts with open flows");
        estimations.drain().await;
        self.check_interrupted("bootstrap")?;

        let mut checkpoint = self
            .repo
            .checkpoint()
            .await?
            .ok_or_else(|| anyhow!("checkpoint missing after bootstrap scan"))?;
        checkpoint.last_bootstrap_block = Some(checkpoint.last_event_scan_block);
        self.repo.upsert_checkpoint(&checkpoint).await?;

        info!(block = checkpoint.last_event_scan_block, "Bootstrap complete");
        Ok(report)
    }

    async fn register_tokens(&self, tokens: &[Address]) -> Result<usize> {
        let mut registered = 0;
        for &token in tokens {
            if self.repo.super_token(token).await?.is_some() {
                continue;
            }
            let info = self
                .rpc
                .token_info(token)
                .await
                .with_context(|| format!("reading token {token}"))?;
            info!(token = %token, symbol = %info.symbol, "Registering super token");
            self.repo
                .upsert_super_token(&SuperToken {
                    address: token,
                    symbol: info.symbol,
                    name: info.name,
                    priority_bond_holder: None,
                    priority_mode: PriorityMode::Unresolved,
                    liquidation_period: info.liquidation_period,
                    patrician_period: info.patrician_period,
                    listed: true,
                    delay_seconds: 0,
                })
                .await?;
            registered += 1;
        }
        Ok(registered)
    }

    async fn resolve_priorities(&self) -> Result<()> {
        let queue: TaskQueue<Task> = TaskQueue::new(
            "priority",
            self.settings.concurrency,
            self.settings.retry,
            self.resolver.clone(),
            self.shutdown.clone(),
        );
        for token in self.repo.super_tokens().await? {
            queue.push(Task::token(token.address, "sync"));
        }
        queue.drain().await;
        self.check_interrupted("priority")
    }

    fn check_interrupted(&self, stage: &str) -> Result<()> {
        if !self.shutdown.is_triggered() {
            return Ok(());
        }
        match self.shutdown.fatal() {
            Some(fatal) => Err(fatal.into()),
            None => bail!("{stage} interrupted by shutdown"),
        }
    }
}

/// Inclusive `[from, to]` windows of at most `size` blocks.
fn block_windows(low: u64, high: u64, size: u64) -> Vec<(u64, u64)> {
    let size = size.max(1);
    let mut windows = Vec::new();
    let mut from = low;
    while from <= high {
        let to = from.saturating_add(size - 1).min(high);
        windows.push((from, to));
        if to == u64::MAX {
            break;
        }
        from = to + 1;
    }
    windows
}

/// Fetches and stores one block window.
struct WindowScanner {
    repo: Arc<dyn Repository>,
    rpc: Arc<dyn ChainRpc>,
    mode: SyncMode,
    touched: DashSet<Address>,
    events: AtomicUsize,
    updates: Mutex<Vec<AgreementTask>>,
}

#[async_trait]
impl TaskHandler<Task> for WindowScanner {
    async fn handle(&self, task: &Task) -> Result<()> {
        let Some((from, to)) = task.block_range else {
            warn!(task = %task, "Window task without block range");
            return Ok(());
        };

        let (cfa, gda) = tokio::try_join!(
            self.rpc.get_logs(FlowSource::Cfa, from, to, None),
            self.rpc.get_logs(FlowSource::Gda, from, to, None)
        )?;

        let mut events: Vec<NormalizedEvent> =
            cfa.iter().chain(gda.iter()).map(NormalizedEvent::from).collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));

        for event in &events {
            let agreement = &event.agreement;
            self.repo.create_agreement_event(event.log_index, agreement).await?;
            self.repo.upsert_agreement(agreement).await?;
            if let Some(distribution) = &event.distribution {
                self.repo
                    .create_distribution_event(event.log_index, distribution)
                    .await?;
                self.repo.upsert_distribution(distribution).await?;
            }
            self.touched.insert(agreement.super_token);

            if self.mode == SyncMode::Live {
                self.updates.lock().push(AgreementTask {
                    source: agreement.source,
                    token: agreement.super_token,
                    sender: agreement.sender,
                    receiver: agreement.receiver,
                    block_number: agreement.block_number,
                    retry_count: 0,
                });
            }
        }

        self.events.fetch_add(events.len(), Ordering::Relaxed);
        debug!(from, to, events = events.len(), "Window stored");
        Ok(())
    }
}
