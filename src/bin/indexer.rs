use anyhow::Result;
use bridge_indexer::chain::ChainReader;
use bridge_indexer::config::IndexerConfig;
use bridge_indexer::coordinator::{SyncCoordinator, SyncOutcome};
use bridge_indexer::cursor::WatchTarget;
use bridge_indexer::processor::EventProcessor;
use bridge_indexer::queue::SqliteQueue;
use bridge_indexer::repository::Database;
use bridge_indexer::rpc::RpcClient;
use bridge_indexer::store::SqliteEventStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting bridge event indexer");

    let config = IndexerConfig::from_env()?;
    config.validate()?;
    info!("Configuration loaded");
    info!("Bridge address: {:?}", config.src_bridge_address);
    info!(
        "RPC URLs: {} endpoint(s) configured, sync mode {}, watch mode {}",
        config.src_rpc_urls.len(),
        config.sync_mode,
        config.watch_mode
    );

    let db = Database::new(&config.database_url)?;
    let queue_db = if config.queue_database_url == config.database_url {
        db.clone()
    } else {
        Database::new(&config.queue_database_url)?
    };
    info!("Database initialized");

    let client = Arc::new(RpcClient::new(
        &config.src_rpc_urls,
        config.src_ws_url.clone(),
        config.rpc_timeout,
    )?);
    let src_chain_id = client.chain_id().await?;
    info!("RPC client connected to chain {}", src_chain_id);

    let store = Arc::new(SqliteEventStore::new(db));
    let processor = Arc::new(EventProcessor::new(
        WatchTarget {
            src_chain_id,
            contract_address: config.src_bridge_address,
            event: config.event_name,
        },
        config.dest_bridge_address,
        store.clone(),
        store,
        Arc::new(SqliteQueue::new(queue_db)),
    ));
    let coordinator = SyncCoordinator::new(&config, client, processor);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutdown requested, finishing in-flight work");
        shutdown.cancel();
    });

    match coordinator.run(&cancel).await {
        Ok(SyncOutcome::ReachedTarget(block)) => info!("Indexed up to target block {}", block),
        Ok(SyncOutcome::Stopped) => info!("Indexer stopped"),
        Err(e) => {
            error!("Indexer error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
