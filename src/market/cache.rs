use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::series::{OhlcvSeries, Timeframe};
use super::MarketData;

struct CacheEntry {
    fetched_at: Instant,
    start_ms: i64,
    end_ms: i64,
    series: Arc<OhlcvSeries>,
}

/// Read-through TTL cache in front of a [`MarketData`] source.
///
/// Workers all request the same now-anchored windows, so a cached fetch for
/// one (symbol, timeframe) serves the whole worker pool until it expires.
/// A cached window is reused whenever it covers the requested range.
pub struct SeriesCache {
    source: Box<dyn MarketData>,
    ttl: Duration,
    entries: DashMap<(String, Timeframe), CacheEntry>,
}

impl SeriesCache {
    pub fn new(source: Box<dyn MarketData>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            entries: DashMap::new(),
        }
    }

}

impl MarketData for SeriesCache {
    fn get_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<OhlcvSeries> {
        let key = (symbol.to_string(), timeframe);
        if let Some(entry) = self.entries.get(&key) {
            let fresh = entry.fetched_at.elapsed() < self.ttl;
            let covers = entry.start_ms <= start_ms && entry.end_ms >= end_ms;
            if fresh && covers {
                return Ok(entry.series.between(start_ms, end_ms));
            }
        }

        let series = self.source.get_series(symbol, timeframe, start_ms, end_ms)?;
        tracing::debug!(%symbol, timeframe = %timeframe, bars = series.len(), "market data fetched");
        self.entries.insert(
            key,
            CacheEntry {
                fetched_at: Instant::now(),
                start_ms,
                end_ms,
                series: Arc::new(series.clone()),
            },
        );
        Ok(series)
    }
}
