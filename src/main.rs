use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use starknet_events_monitor::config::AppCfg;
use starknet_events_monitor::contracts;
use starknet_events_monitor::listener::Listener;
use starknet_events_monitor::metrics::WebhookMetrics;
use starknet_events_monitor::provider::RpcEventProvider;
use starknet_events_monitor::queue::NatsQueue;
use starknet_events_monitor::rate_limit::{CLEANUP_INTERVAL, MultiTierRateLimiter};
use starknet_events_monitor::signature::WebhookSigner;
use starknet_events_monitor::store::{InMemoryEventStore, InMemoryTransactionStore};
use starknet_events_monitor::supervisor::ListenerSupervisor;
use starknet_events_monitor::web_api::{AppState, serve};
use starknet_events_monitor::webhook::WebhookProcessor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();

    let cfg_path = std::env::args().nth(1).unwrap_or_else(|| "./config.yaml".to_string());
    let cfg = AppCfg::load(&cfg_path)?;

    // deps
    let provider = Arc::new(RpcEventProvider::new(&cfg.chain.rpc_url)?);
    provider.check_connection().await;

    let queue = Arc::new(NatsQueue::connect(&cfg.nats.url, cfg.nats_max_attempts()).await?);
    let event_store = Arc::new(InMemoryEventStore::new());
    let transactions = Arc::new(InMemoryTransactionStore::new());

    // listeners, one per configured contract
    let listener_cfg = cfg.listener_cfg();
    let listeners: Vec<Arc<Listener>> = cfg
        .contracts
        .iter()
        .map(|contract| {
            Listener::new(
                contracts::spec_for(contract),
                provider.clone(),
                queue.clone(),
                Some(event_store.clone()),
                listener_cfg,
            )
        })
        .collect();
    let supervisor = Arc::new(ListenerSupervisor::new(listeners));
    supervisor.start_all().await?;

    // webhook ingress pipeline
    let metrics = Arc::new(WebhookMetrics::new());
    let processor = Arc::new(WebhookProcessor::new(
        transactions,
        metrics.clone(),
        cfg.webhook_max_retries(),
        cfg.webhook_dedup_ttl(),
    ));
    let limiter = Arc::new(MultiTierRateLimiter::new());

    let sweep_limiter = limiter.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(CLEANUP_INTERVAL).await;
            sweep_limiter.sweep(Utc::now().timestamp_millis());
        }
    });

    let shutdown_supervisor = supervisor.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for shutdown signal: {err:?}");
            return;
        }
        info!("shutdown signal received");
        shutdown_supervisor.stop_all();
    });

    let state = AppState {
        signer: Arc::new(WebhookSigner::new(cfg.webhook.secret.clone())),
        processor,
        metrics,
        limiter,
        supervisor,
    };

    serve(state, &cfg.bind_address()).await?;

    Ok(())
}
