use std::sync::Arc;

use tracing::info;

use rentcap::clock::SystemClock;
use rentcap::config::Config;
use rentcap::engine::{Engine, EngineOptions};
use rentcap::notify::NotifyHub;
use rentcap::stock::InMemoryStock;
use rentcap::sweeper;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    rentcap::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let stock = match &config.stock_file {
        Some(path) => InMemoryStock::load_json(path)?,
        None => InMemoryStock::new(),
    };
    let engine = Arc::new(Engine::with_options(
        config.wal_path(),
        Arc::new(stock),
        Arc::new(NotifyHub::new()),
        EngineOptions {
            admission_timeout: config.admission_timeout,
            clock: Arc::new(SystemClock),
        },
    )?);

    info!("rentcap ledger ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  products: {}", engine.ledger.product_count());
    info!("  admission_timeout: {:?}", config.admission_timeout);
    info!("  sweep_interval: {:?}", config.sweep_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweep = tokio::spawn(sweeper::run_sweeper(engine.clone(), config.sweep_interval));
    let compact = tokio::spawn(sweeper::run_compactor(
        engine.clone(),
        config.compact_threshold,
    ));

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(_) => {
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    shutdown.await;

    info!("shutdown signal received, stopping background tasks");
    sweep.abort();
    compact.abort();
    // Leave a compact journal behind for the next start.
    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("rentcap stopped");
    Ok(())
}
