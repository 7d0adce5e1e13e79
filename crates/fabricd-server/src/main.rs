use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fabricd_bus::MemoryBus;
use fabricd_coord::{MasterElection, MemoryCoordStore};
use fabricd_engine::{Engine, Notifier};
use fabricd_server::{ApiServer, ServerConfig};
use fabricd_store::{CacheConfig, MemoryObjectTable};

#[derive(Parser)]
#[command(name = "fabricd", about = "fabricd configuration API server")]
struct Args {
    /// Configuration file (TOML or JSON).
    #[arg(long, env = "FABRICD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) if path.exists() => ServerConfig::from_file(path)?,
        Some(path) => {
            tracing::warn!("config file not found, using defaults: {}", path.display());
            ServerConfig::default()
        }
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    let config = Arc::new(config);

    // In-process backends; a deployment wires real stores here.
    let engine = Engine::new(
        Arc::new(MemoryCoordStore::new()),
        Arc::new(MemoryObjectTable::new()),
        Arc::new(MemoryBus::new()),
        config.engine_config(),
        CacheConfig::default(),
    )?;

    let consumer_id = format!("{}-api-{}", config.cluster_id, std::process::id());

    // One candidate per process; the winner runs cluster-singleton
    // duties. The notifier loop re-evaluates so a process rejoins the
    // election after session loss.
    let election = Arc::new(MasterElection::new(
        engine.coord().clone(),
        "/api-server-election",
    )?);
    let node_id = consumer_id.clone();
    election.register(&consumer_id, move || {
        tracing::info!("{} is now the API master", node_id);
    })?;

    let notifier = Notifier::new(engine.clone_handle(), &consumer_id);
    let max_pending = config.rabbit_max_pending_updates;
    let bus = engine.bus().clone();
    let election_poll = election.clone();
    let notify_handle = tokio::spawn(async move {
        loop {
            match notifier.run_once() {
                Ok(0) => tokio::time::sleep(Duration::from_millis(100)).await,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("notification dispatch failed: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
            if let Ok(pending) = bus.num_pending_messages(notifier.consumer_id()) {
                if pending > max_pending {
                    tracing::warn!(pending, "notification backlog above limit");
                }
            }
            if let Err(e) = election_poll.evaluate() {
                tracing::error!("election evaluation failed: {}", e);
            }
        }
    });

    let api = ApiServer::new(engine, config);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.serve().await {
            tracing::error!("API serve error: {}", e);
        }
    });

    tokio::select! {
        _ = notify_handle => {}
        _ = api_handle => {}
    }

    Ok(())
}
