//! kv-arc-offload: replay driver for the KV offloading engine.
//!
//! Builds the configured offloading policy over a simulated backend, runs a
//! synthetic request stream through it and the paged allocator, and prints
//! the resulting statistics as JSON.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use kv_arc_offload::cache::adaptive::AdaptiveArcManager;
use kv_arc_offload::cache::arc::ArcOffloadingManager;
use kv_arc_offload::cache::backend::SimulatedBackend;
use kv_arc_offload::cache::lru_policy::LruOffloadingManager;
use kv_arc_offload::cache::manager::OffloadingManager;
use kv_arc_offload::cache::service::OffloadingService;
use kv_arc_offload::config::{Cli, Config, Policy};
use kv_arc_offload::paged::manager::new_shared_cache_manager;
use kv_arc_offload::replay::Replay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kv_arc_offload=debug"
    } else {
        "kv_arc_offload=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("kv-arc-offload v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    if let Some(requests) = cli.requests {
        config.replay.requests = requests;
    }
    if let Some(policy) = cli.policy {
        config.offload.policy = policy;
    }
    config.validate()?;

    info!(
        policy = ?config.offload.policy,
        medium = %config.offload.medium,
        num_blocks = config.offload.num_blocks,
        block_size_bytes = config.offload.block_size_bytes,
        requests = config.replay.requests,
        "Configuration loaded"
    );

    let backend = SimulatedBackend::new(
        config.offload.medium,
        config.offload.num_blocks,
        config.offload.block_size_bytes,
    );
    let mut affinity = None;
    let manager: Arc<dyn OffloadingManager> = match config.offload.policy {
        Policy::Arc => Arc::new(ArcOffloadingManager::with_config(backend, &config.arc)),
        Policy::Adaptive => {
            let adaptive = Arc::new(AdaptiveArcManager::with_config(backend, config.arc.clone()));
            affinity = Some(adaptive.clone());
            adaptive
        }
        Policy::Lru => Arc::new(LruOffloadingManager::new(backend)),
    };

    let service = OffloadingService::spawn(manager, config.offload.queue_depth)?;
    let cache = new_shared_cache_manager(&config.allocator);

    let mut replay = Replay::new(config.replay.clone(), service.handle(), cache);
    if let Some(adaptive) = affinity {
        replay = replay.with_affinity(adaptive);
    }
    let report = replay.run().await?;
    service.shutdown().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
