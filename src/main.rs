//! Main entry point for the flywheel buyback engine.
//!
//! Wires the storage, chain client, trade counter, stream consumer, executor,
//! and scheduler together, then runs until ctrl-c. Every replica of this
//! binary consumes the trade feed; the lease decides which one drives cycles.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn, Level};

use flywheel::config::EngineConfig;
use flywheel::engine::{
    ActivityLog, CycleExecutor, CycleScheduler, EngineStorage, LeaseManager, SqliteStore,
    StreamConfig, StreamConsumer, ThreadRngThreshold, TradeCounter, TxEngineClient,
    MONITORED_MINT_KEY,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let config = Arc::new(EngineConfig::from_env()?);
    info!("starting flywheel engine as {}", config.instance_id);

    let storage = SqliteStore::connect(&config.database_url).await?;

    // Bootstrap the monitored mint from the environment on first run; the
    // settings table stays the source of truth afterwards.
    if let Ok(mint) = std::env::var("FLYWHEEL_MINT") {
        if !mint.trim().is_empty() {
            storage.set_setting(MONITORED_MINT_KEY, mint.trim()).await?;
            info!("monitored mint set to {}", mint.trim());
        }
    }

    let chain = Arc::new(TxEngineClient::new(
        config.engine_url.clone(),
        config.engine_api_key.clone(),
        config.rpc_endpoints.head.clone(),
        10,
    ));

    let counter = Arc::new(TradeCounter::new(
        storage.clone(),
        Arc::new(ThreadRngThreshold),
        config.min_qualifying_sol,
        config.threshold_min,
        config.threshold_max,
    ));
    counter.init().await?;

    let activity = ActivityLog::shared();

    let stream = StreamConsumer::new(
        storage.clone(),
        counter.clone(),
        StreamConfig {
            ws_url: config.ws_url.clone(),
            ..Default::default()
        },
        activity.clone(),
    );
    let stream_health = stream.health();

    let executor = Arc::new(CycleExecutor::new(
        storage.clone(),
        chain,
        counter,
        activity.clone(),
        config.clone(),
    ));

    let lease = LeaseManager::new(storage.clone(), config.instance_id.clone(), config.lease_ttl);
    let scheduler = Arc::new(CycleScheduler::new(
        storage,
        lease,
        executor,
        stream_health,
        activity,
        config,
    ));

    let (stream_shutdown_tx, stream_shutdown_rx) = mpsc::channel(1);
    let (scheduler_shutdown_tx, scheduler_shutdown_rx) = mpsc::channel(1);

    let stream_handle = tokio::spawn(stream.run(stream_shutdown_rx));
    let scheduler_handle = tokio::spawn(scheduler.clone().run(scheduler_shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    let _ = stream_shutdown_tx.send(()).await;
    let _ = scheduler_shutdown_tx.send(()).await;

    if let Err(e) = stream_handle.await {
        warn!("stream consumer task ended abnormally: {}", e);
    }
    if let Err(e) = scheduler_handle.await {
        warn!("scheduler task ended abnormally: {}", e);
    }

    info!("flywheel engine stopped");
    Ok(())
}
