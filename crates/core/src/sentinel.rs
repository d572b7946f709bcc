//! Agent orchestration.
//!
//! Wires the sync engine, queues, scheduler and event subscription together,
//! runs the periodic loops and tears them down on shutdown.

use alloy::primitives::U256;
use anyhow::Result;
use futures::StreamExt;
use sentinel_chain::{ChainRpc, EventListener, FlowEvent, FlowSource, ProtocolAddresses};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SentinelConfig;
use crate::error::FatalError;
use crate::estimation::{AgreementUpdater, EstimationEngine};
use crate::health::HealthReport;
use crate::model::{AgreementTask, Task};
use crate::notifier::Notifier;
use crate::now_secs;
use crate::priority::PriorityResolver;
use crate::queue::TaskQueue;
use crate::repository::Repository;
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::shutdown::Shutdown;
use crate::sync::{SyncEngine, SyncMode, SyncSettings};
use crate::ticker::Ticker;
use crate::transaction::{TransactionEngine, TxSettings};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SentinelSettings {
    pub observer: bool,
    pub live_interval: Duration,
    pub liquidation_interval: Duration,
    pub health_interval: Duration,
}

pub struct Sentinel {
    repo: Arc<dyn Repository>,
    rpc: Arc<dyn ChainRpc>,
    sync: Arc<SyncEngine>,
    /// `None` in observer mode
    scheduler: Option<Arc<Scheduler>>,
    estimations: TaskQueue<Task>,
    agreements: TaskQueue<AgreementTask>,
    listener: Option<Arc<EventListener>>,
    health: Arc<HealthReport>,
    shutdown: Shutdown,
    settings: SentinelSettings,
}

impl Sentinel {
    /// Build every component from configuration.
    pub fn new(
        config: &SentinelConfig,
        repo: Arc<dyn Repository>,
        rpc: Arc<dyn ChainRpc>,
        addresses: ProtocolAddresses,
        notifier: Arc<dyn Notifier>,
        shutdown: Shutdown,
    ) -> Self {
        let health = Arc::new(HealthReport::new());
        let observer = config.liquidation.observer;
        let retry = config.queue.retry_policy();
        let concurrency = config.queue.concurrency;

        let estimations: TaskQueue<Task> = TaskQueue::new(
            "estimation",
            concurrency,
            retry,
            Arc::new(EstimationEngine::new(repo.clone(), rpc.clone())),
            shutdown.clone(),
        );
        let agreements: TaskQueue<AgreementTask> = TaskQueue::new(
            "agreement",
            concurrency,
            retry,
            Arc::new(AgreementUpdater::new(repo.clone(), rpc.clone(), estimations.clone())),
            shutdown.clone(),
        );

        let resolver = Arc::new(PriorityResolver::new(
            repo.clone(),
            rpc.clone(),
            config.priority.address,
            config.priority.additional_delay_secs,
        ));
        let sync = SyncEngine::new(
            repo.clone(),
            rpc.clone(),
            resolver,
            SyncSettings {
                epoch_block: config.sync.epoch_block,
                max_query_block_range: config.sync.max_query_block_range,
                block_offset: config.sync.block_offset,
                observer,
                concurrency,
                retry,
            },
            shutdown.clone(),
            health.clone(),
        )
        .with_agreement_queue(agreements.clone());

        let scheduler = (!observer).then(|| {
            let engine = Arc::new(TransactionEngine::new(
                rpc.clone(),
                notifier,
                shutdown.clone(),
                health.clone(),
                TxSettings {
                    max_gas_price: config.gas.max_gas_price_wei(),
                    multiplier_bps: config.gas.retry_multiplier_bps(),
                    broadcast_timeout: config.liquidation.broadcast_timeout(),
                    retry_delay: retry.base_delay,
                },
            ));
            Arc::new(Scheduler::new(
                repo.clone(),
                rpc.clone(),
                engine,
                estimations.clone(),
                addresses,
                SchedulerSettings {
                    max_batch_tx: config.liquidation.max_batch_tx,
                    filter: config.tokens.filter(),
                    limit: config.liquidation.max_candidates,
                    use_thresholds: config.liquidation.use_thresholds,
                },
                shutdown.clone(),
                health.clone(),
            ))
        });

        let listener = config.network.ws_url().map(|ws| {
            let mut agreements = vec![(FlowSource::Cfa, addresses.cfa)];
            if let Some(gda) = addresses.gda {
                agreements.push((FlowSource::Gda, gda));
            }
            Arc::new(EventListener::new(ws, agreements))
        });

        Self {
            repo,
            rpc,
            sync: Arc::new(sync),
            scheduler,
            estimations,
            agreements,
            listener,
            health,
            shutdown,
            settings: SentinelSettings {
                observer,
                live_interval: config.sync.live_interval(),
                liquidation_interval: config.liquidation.interval(),
                health_interval: config.sync.health_interval(),
            },
        }
    }

    pub fn health(&self) -> Arc<HealthReport> {
        self.health.clone()
    }

    /// Refuse to start without a funded signer, unless observing.
    pub async fn check_operator(&self) -> Result<()> {
        if self.settings.observer {
            info!("Observer mode, liquidations disabled");
            return Ok(());
        }

        let Some(operator) = self.rpc.signer_address() else {
            return Err(self.fatal(FatalError::MissingSigner));
        };
        let balance = self.rpc.native_balance(operator).await?;
        if balance == U256::ZERO {
            return Err(self.fatal(FatalError::UnfundedAccount { account: operator }));
        }

        info!(operator = %operator, balance = %balance, "Operator account ready");
        Ok(())
    }

    /// Run until shutdown. Returns the fatal reason, if any.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.check_operator().await?;
        self.initial_sync().await?;

        let mut tickers = Vec::new();

        let sync = self.sync.clone();
        tickers.push(Ticker::spawn(
            "sync",
            self.settings.live_interval,
            self.shutdown.clone(),
            move || {
                let sync = sync.clone();
                async move {
                    if let Err(e) = sync.run(SyncMode::Live).await {
                        warn!(error = %format!("{e:#}"), "Live sync failed");
                    }
                }
            },
        ));

        if let Some(scheduler) = self.scheduler.clone() {
            tickers.push(Ticker::spawn(
                "liquidation",
                self.settings.liquidation_interval,
                self.shutdown.clone(),
                move || {
                    let scheduler = scheduler.clone();
                    async move {
                        if let Err(e) = scheduler.run_pass().await {
                            warn!(error = %format!("{e:#}"), "Liquidation pass failed");
                        }
                    }
                },
            ));
        }

        let health = self.health.clone();
        let max_staleness = self.settings.live_interval.as_secs().saturating_mul(5);
        tickers.push(Ticker::spawn(
            "health",
            self.settings.health_interval,
            self.shutdown.clone(),
            move || {
                let health = health.clone();
                async move { health.log(now_secs(), max_staleness) }
            },
        ));

        let events = self.listener.clone().map(|listener| self.spawn_event_loop(listener));

        info!(tickers = tickers.len(), live_events = events.is_some(), "Sentinel running");
        self.shutdown.cancelled().await;
        info!("Stopping sentinel");

        for ticker in &tickers {
            ticker.stop();
        }
        for ticker in tickers {
            ticker.join().await;
        }
        if let Some(handle) = events {
            handle.abort();
        }

        self.agreements.close();
        self.estimations.close();
        self.agreements.drain().await;
        self.estimations.drain().await;

        match self.shutdown.fatal() {
            Some(fatal) => {
                self.health.record_fatal(fatal.to_string());
                Err(fatal.into())
            }
            None => {
                info!("Sentinel stopped");
                Ok(())
            }
        }
    }

    /// Bootstrap on a fresh store, otherwise catch up from the checkpoint.
    async fn initial_sync(&self) -> Result<()> {
        let bootstrapped = self
            .repo
            .checkpoint()
            .await?
            .is_some_and(|cp| cp.last_bootstrap_block.is_some());

        if bootstrapped {
            self.sync.run(SyncMode::Live).await?;
            // Estimations flagged before the last exit never got recomputed
            let stale: Vec<_> = self
                .repo
                .estimations()
                .await?
                .into_iter()
                .filter(|e| e.recalculate)
                .collect();
            if !stale.is_empty() {
                info!(count = stale.len(), "Re-queueing flagged estimations");
            }
            for estimation in stale {
                self.estimations.push(Task::estimate(
                    estimation.super_token,
                    estimation.address,
                    "restart",
                ));
            }
        } else {
            info!("No bootstrap recorded, reconciling from the epoch block");
            self.sync.reconcile(&self.estimations).await?;
        }
        Ok(())
    }

    fn spawn_event_loop(&self, listener: Arc<EventListener>) -> JoinHandle<()> {
        let agreements = self.agreements.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = forward_events(&listener, &agreements) => match result {
                        Ok(()) => warn!("Event stream ended, reconnecting in 5s..."),
                        Err(e) => error!(error = %format!("{e:#}"), "Event stream failed, reconnecting in 5s..."),
                    },
                    _ = shutdown.cancelled() => return,
                }
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        })
    }

    fn fatal(&self, reason: FatalError) -> anyhow::Error {
        self.shutdown.trigger_fatal(reason.clone());
        self.health.record_fatal(reason.to_string());
        reason.into()
    }
}

async fn forward_events(listener: &EventListener, agreements: &TaskQueue<AgreementTask>) -> Result<()> {
    let mut stream = listener.subscribe_flow_events().await?;
    while let Some(event) = stream.next().await {
        agreements.push(agreement_task(&event));
    }
    Ok(())
}

fn agreement_task(event: &FlowEvent) -> AgreementTask {
    AgreementTask {
        source: event.source(),
        token: event.token(),
        sender: event.sender(),
        receiver: event.receiver(),
        block_number: event.block_number(),
        retry_count: 0,
    }
}
