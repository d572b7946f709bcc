//! Flow Sentinel
//!
//! Watches streaming-payment agreements and closes flows whose senders have
//! run out of balance.
//! Features:
//! - Windowed event sync with a durable checkpoint plus live WebSocket events
//! - Insolvency estimation per (account, token)
//! - Priority-aware scheduling with batch liquidation support
//! - Gas-bumping transaction recovery

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sentinel_chain::gas::{create_gas_strategy, GasStrategy};
use sentinel_chain::{ChainRpc, ProviderManager, TransactionSigner};
use sentinel_core::{
    LogNotifier, MemoryRepository, Notifier, Repository, Sentinel, SentinelConfig, Shutdown,
    WebhookNotifier,
};

/// Environment variable names.
mod env {
    pub const PRIVATE_KEY: &str = "PRIVATE_KEY";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = SentinelConfig::load()?;
    config.log_config();

    let notifier = build_notifier(&config);
    let shutdown = Shutdown::new();

    let result = run(config, notifier.clone(), shutdown.clone()).await;

    if let Some(fatal) = shutdown.fatal() {
        error!(reason = %fatal, "Sentinel terminated");
        notifier.notify(&format!("sentinel terminated: {fatal}")).await;
        std::process::exit(1);
    }
    if let Err(e) = &result {
        notifier.notify(&format!("sentinel failed to start: {e:#}")).await;
    }
    result
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sentinel_core=debug,sentinel_chain=debug"));
    let json = std::env::var(env::LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn build_notifier(config: &SentinelConfig) -> Arc<dyn Notifier> {
    match config.notifications.webhook_url() {
        Some(url) => match WebhookNotifier::new(url, config.notifications.timeout()) {
            Ok(webhook) => Arc::new(webhook),
            Err(e) => {
                error!(error = %e, "Webhook notifier unavailable, logging only");
                Arc::new(LogNotifier)
            }
        },
        None => Arc::new(LogNotifier),
    }
}

async fn run(config: SentinelConfig, notifier: Arc<dyn Notifier>, shutdown: Shutdown) -> Result<()> {
    info!("Starting Flow Sentinel");

    let addresses = config.network.contracts.resolve()?;
    let gas_strategy: Arc<dyn GasStrategy> =
        create_gas_strategy(config.gas.pricing.as_str(), config.gas.default_gas_price_wei()).into();
    let http = config.network.http.as_str();
    let send = config.network.send_url();
    let timeout = config.network.rpc_timeout();

    let signer = match std::env::var(env::PRIVATE_KEY) {
        Ok(key) if !config.liquidation.observer => {
            // The signer is chain-bound, so ask the node first
            let reader =
                ProviderManager::new(http, send, addresses, None, gas_strategy.clone(), timeout).await?;
            let chain_id = reader.chain_id().await?;
            let signer = TransactionSigner::new(&key, chain_id, gas_strategy.clone())
                .context("invalid PRIVATE_KEY")?;
            info!(address = %signer.address, chain_id, "Signer initialized");
            Some(signer)
        }
        _ => None,
    };

    let rpc = Arc::new(ProviderManager::new(http, send, addresses, signer, gas_strategy, timeout).await?);

    let repo: Arc<dyn Repository> = match &config.persistence.snapshot_path {
        Some(path) => Arc::new(MemoryRepository::open(path).await?),
        None => Arc::new(MemoryRepository::new()),
    };
    for threshold in config.tokens.thresholds() {
        repo.upsert_threshold(&threshold).await?;
    }

    let sentinel = Arc::new(Sentinel::new(
        &config,
        repo,
        rpc,
        addresses,
        notifier,
        shutdown.clone(),
    ));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            ctrl_c.trigger();
        }
    });

    sentinel.run().await
}
