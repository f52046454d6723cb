pub mod cache;
pub mod parquet;
pub mod series;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use series::{OhlcvSeries, Timeframe};

/// Per-coin exchange limits. Read-only to the funnel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coin {
    pub symbol: String,
    pub max_leverage: f64,
    pub min_notional: f64,
    pub tradable: bool,
}

/// Read interface over the external market-data provider.
///
/// Guarantees expected from implementations: gap-free bars, bar-open UTC
/// timestamps, strictly increasing order.
pub trait MarketData: Send + Sync {
    fn get_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<OhlcvSeries>;
}

/// Read interface over the external coin registry.
pub trait CoinRegistry: Send + Sync {
    fn coin(&self, symbol: &str) -> Option<Coin>;

    /// Tradable symbols ordered by 24h volume descending.
    fn top_by_volume(&self, limit: usize) -> Vec<String>;
}

/// Coin registry backed by a fixed table (the `[universe]` config section).
pub struct StaticCoinRegistry {
    coins: Vec<(Coin, f64)>,
}

impl StaticCoinRegistry {
    /// `entries` are (coin, 24h quote volume) pairs.
    pub fn new(mut entries: Vec<(Coin, f64)>) -> Self {
        entries.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        Self { coins: entries }
    }
}

impl CoinRegistry for StaticCoinRegistry {
    fn coin(&self, symbol: &str) -> Option<Coin> {
        self.coins
            .iter()
            .find(|(c, _)| c.symbol == symbol)
            .map(|(c, _)| c.clone())
    }

    fn top_by_volume(&self, limit: usize) -> Vec<String> {
        self.coins
            .iter()
            .filter(|(c, _)| c.tradable)
            .take(limit)
            .map(|(c, _)| c.symbol.clone())
            .collect()
    }
}
