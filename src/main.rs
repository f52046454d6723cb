use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing_subscriber::{self, EnvFilter};

use perpfunnel::config::{Config, CONFIG_ENV};
use perpfunnel::market::parquet::ParquetSource;
use perpfunnel::market::{Coin, StaticCoinRegistry};
use perpfunnel::pipeline::{worker, Pipeline};
use perpfunnel::store::Store;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::var(CONFIG_ENV)
        .map_or_else(|_| PathBuf::from("perpfunnel.toml"), PathBuf::from);
    let config = Config::load(&config_path)?;
    tracing::info!(config = %config_path.display(), workers = config.workers.count, "starting funnel");

    let store = Arc::new(Store::open(Path::new(&config.data.store_path))?);
    let market = ParquetSource::new(config.data.root.clone());
    let registry = StaticCoinRegistry::new(
        config
            .universe
            .coins
            .iter()
            .map(|entry| {
                (
                    Coin {
                        symbol: entry.symbol.clone(),
                        max_leverage: entry.max_leverage,
                        min_notional: entry.min_notional,
                        tradable: entry.tradable,
                    },
                    entry.volume_24h,
                )
            })
            .collect(),
    );

    let pipeline = Arc::new(Pipeline::new(
        config,
        store,
        Box::new(market),
        Box::new(registry),
    )?);
    tracing::info!(pool_members = pipeline.pool.len(), "pool state restored");

    let shutdown = Arc::new(AtomicBool::new(false));
    let handles = worker::spawn(pipeline, Arc::clone(&shutdown));
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }
    Ok(())
}
