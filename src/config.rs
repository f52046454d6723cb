use anyhow::{Context, Result};
use garde::Validate;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::market::series::Timeframe;

/// Environment variable naming the config file; falls back to
/// `perpfunnel.toml` in the working directory.
pub const CONFIG_ENV: &str = "PERPFUNNEL_CONFIG";

/// Full funnel configuration. Every key is required — a missing key is a
/// startup failure, not a silent default.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[garde(dive)]
    pub pool: PoolConfig,
    #[garde(dive)]
    pub thresholds: ThresholdConfig,
    #[garde(dive)]
    pub oos: OosConfig,
    #[garde(dive)]
    pub is: IsConfig,
    #[garde(dive)]
    pub wfa: WfaConfig,
    #[garde(dive)]
    pub shuffle: ShuffleConfig,
    #[garde(dive)]
    pub risk: RiskConfig,
    #[garde(dive)]
    pub exchange: ExchangeConfig,
    #[garde(dive)]
    pub retest: RetestConfig,
    #[garde(dive)]
    pub workers: WorkersConfig,
    #[garde(dive)]
    pub universe: UniverseConfig,
    #[garde(dive)]
    pub data: DataConfig,
    #[garde(dive)]
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PoolConfig {
    #[garde(range(min = 1))]
    pub max_size: usize,
    #[garde(range(min = 0.0, max = 100.0))]
    pub min_score: f64,
}

/// Minimum trade counts per timeframe for the IS and OOS windows.
#[derive(Debug, Clone, Copy, Deserialize, Validate)]
pub struct TradeFloor {
    #[garde(range(min = 1))]
    pub is: usize,
    #[garde(range(min = 1))]
    pub oos: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ThresholdConfig {
    #[garde(skip)]
    pub sharpe: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub win_rate: f64,
    #[garde(skip)]
    pub expectancy: f64,
    #[garde(range(min = 0.0, max = 1.0))]
    pub max_drawdown: f64,
    /// Trade floor applied during the parametric sweep (C3), before the
    /// timeframe-specific floors apply.
    #[garde(range(min = 1))]
    pub min_combo_trades: usize,
    #[garde(custom(all_timeframes_present))]
    pub trades_by_timeframe: HashMap<Timeframe, TradeFloor>,
}

fn all_timeframes_present(
    value: &HashMap<Timeframe, TradeFloor>,
    (): &(),
) -> garde::Result {
    for tf in Timeframe::ALL {
        if !value.contains_key(&tf) {
            return Err(garde::Error::new(format!(
                "trades_by_timeframe is missing an entry for {tf}"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct OosConfig {
    #[garde(range(min = 0.0, max = 1.0))]
    pub max_degradation: f64,
    #[garde(range(min = 1))]
    pub window_days: u32,
    #[garde(range(min = 1))]
    pub min_bars: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct IsConfig {
    #[garde(range(min = 1))]
    pub window_days: u32,
    #[garde(range(min = 1))]
    pub min_bars: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct WfaConfig {
    #[garde(length(min = 1), custom(percentages_in_unit_range))]
    pub window_percentages: Vec<f64>,
    #[garde(skip)]
    pub min_expectancy: f64,
    #[garde(range(min = 1))]
    pub min_profitable_windows: u32,
}

#[allow(clippy::ptr_arg)]
fn percentages_in_unit_range(value: &Vec<f64>, (): &()) -> garde::Result {
    for &p in value {
        if !(0.0..=1.0).contains(&p) || p == 0.0 {
            return Err(garde::Error::new(format!(
                "window percentage {p} must be in (0, 1]"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ShuffleConfig {
    #[garde(range(min = 1))]
    pub iterations: usize,
    #[garde(range(min = 1))]
    pub data_days: u32,
    #[garde(length(min = 1))]
    pub symbol: String,
    /// Pass/fail boundary on the mean similarity between original and
    /// shuffled signal distributions; at or above this, the strategy is
    /// presumed order-insensitive and fails.
    #[garde(range(min = 0.0, max = 1.0))]
    pub max_similarity: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RiskConfig {
    #[garde(range(min = 0.0001, max = 1.0))]
    pub per_trade_pct: f64,
    #[garde(range(min = 1))]
    pub max_concurrent_positions: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ExchangeConfig {
    #[garde(range(min = 0.0, max = 0.1))]
    pub fee_rate: f64,
    #[garde(range(min = 0.0, max = 0.1))]
    pub slippage_pct: f64,
    #[garde(range(min = 0.0))]
    pub min_notional: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RetestConfig {
    #[garde(range(min = 1))]
    pub interval_days: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct WorkersConfig {
    #[garde(range(min = 1))]
    pub count: usize,
    #[garde(range(min = 1))]
    pub stale_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CoinEntry {
    #[garde(length(min = 1))]
    pub symbol: String,
    #[garde(range(min = 1.0))]
    pub max_leverage: f64,
    #[garde(range(min = 0.0))]
    pub min_notional: f64,
    #[garde(skip)]
    pub tradable: bool,
    #[garde(range(min = 0.0))]
    pub volume_24h: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UniverseConfig {
    /// How many coins make up the evaluation portfolio.
    #[garde(range(min = 1))]
    pub portfolio_size: usize,
    #[garde(length(min = 1), dive)]
    pub coins: Vec<CoinEntry>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct DataConfig {
    #[garde(length(min = 1))]
    pub root: String,
    /// Market-data cache TTL; the read-through cache contract requires at
    /// least five minutes.
    #[garde(range(min = 300))]
    pub cache_ttl_secs: u64,
    #[garde(length(min = 1))]
    pub store_path: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SimConfig {
    #[garde(range(min = 1.0))]
    pub initial_equity: f64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Config> {
        let config: Config = toml::from_str(raw).context("failed to parse config")?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
        Ok(config)
    }

    pub fn trade_floor(&self, timeframe: Timeframe) -> TradeFloor {
        self.thresholds.trades_by_timeframe[&timeframe]
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.workers.stale_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.data.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = include_str!("../perpfunnel.toml");

    #[test]
    fn sample_config_parses_and_validates() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.pool.max_size, 300);
        assert!((cfg.pool.min_score - 40.0).abs() < f64::EPSILON);
        assert_eq!(cfg.trade_floor(Timeframe::M5).is, 500);
        assert_eq!(cfg.trade_floor(Timeframe::H2).oos, 5);
    }

    #[test]
    fn missing_key_is_a_startup_failure() {
        let broken = SAMPLE.replace("max_degradation = 0.50\n", "");
        assert!(Config::from_toml_str(&broken).is_err());
    }

    #[test]
    fn missing_timeframe_floor_rejected() {
        let broken = SAMPLE.replace("\"2h\" = { is = 50, oos = 5 }\n", "");
        assert!(Config::from_toml_str(&broken).is_err());
    }

    #[test]
    fn out_of_range_value_rejected() {
        let broken = SAMPLE.replace("min_score = 40.0", "min_score = 140.0");
        assert!(Config::from_toml_str(&broken).is_err());
    }

    #[test]
    fn short_cache_ttl_rejected() {
        let broken = SAMPLE.replace("cache_ttl_secs = 600", "cache_ttl_secs = 60");
        assert!(Config::from_toml_str(&broken).is_err());
    }
}
