#![allow(dead_code)]

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use perpfunnel::config::Config;
use perpfunnel::market::series::{OhlcvSeries, Timeframe, MS_PER_DAY};
use perpfunnel::market::{Coin, MarketData};
use perpfunnel::strategy::{Candidate, CandidateStatus, SourceClass};

/// Shrunken windows so fixtures stay small: 10d IS, 5d OOS, 3d shuffle
/// slice, M15 floors of 10/4 trades.
pub const TEST_CONFIG: &str = r#"
[pool]
max_size = 300
min_score = 40.0

[thresholds]
sharpe = 0.3
win_rate = 0.35
expectancy = 0.002
max_drawdown = 0.50
min_combo_trades = 10

[thresholds.trades_by_timeframe]
"5m" = { is = 30, oos = 10 }
"15m" = { is = 10, oos = 4 }
"30m" = { is = 8, oos = 3 }
"1h" = { is = 6, oos = 2 }
"2h" = { is = 4, oos = 1 }

[oos]
max_degradation = 0.50
window_days = 5
min_bars = 20

[is]
window_days = 10
min_bars = 50

[wfa]
window_percentages = [0.25, 0.50, 0.75, 1.00]
min_expectancy = 0.002
min_profitable_windows = 4

[shuffle]
iterations = 15
data_days = 3
symbol = "BTCUSDT"
max_similarity = 0.90

[risk]
per_trade_pct = 0.02
max_concurrent_positions = 10

[exchange]
fee_rate = 0.00045
slippage_pct = 0.0005
min_notional = 10.0

[retest]
interval_days = 3

[workers]
count = 2
stale_timeout_secs = 1800

[universe]
portfolio_size = 2

[[universe.coins]]
symbol = "BTCUSDT"
max_leverage = 50.0
min_notional = 10.0
tradable = true
volume_24h = 9000000000.0

[[universe.coins]]
symbol = "ETHUSDT"
max_leverage = 50.0
min_notional = 10.0
tradable = true
volume_24h = 4500000000.0

[[universe.coins]]
symbol = "SOLUSDT"
max_leverage = 25.0
min_notional = 10.0
tradable = true
volume_24h = 1800000000.0

[data]
root = "data"
cache_ttl_secs = 300
store_path = ":memory:"

[sim]
initial_equity = 10000.0
"#;

pub fn test_config() -> Config {
    Config::from_toml_str(TEST_CONFIG).unwrap()
}

/// A fixed evaluation instant so fixtures and assertions are reproducible.
pub fn anchor() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn test_coin(symbol: &str) -> Coin {
    Coin {
        symbol: symbol.to_string(),
        max_leverage: 50.0,
        min_notional: 10.0,
        tradable: true,
    }
}

/// In-memory market data source for tests.
pub struct FixtureMarket {
    series: Mutex<HashMap<(String, Timeframe), OhlcvSeries>>,
}

impl FixtureMarket {
    pub fn new() -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, series: OhlcvSeries) {
        self.series
            .lock()
            .unwrap()
            .insert((series.symbol.clone(), series.timeframe), series);
    }
}

impl MarketData for FixtureMarket {
    fn get_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<OhlcvSeries> {
        let map = self.series.lock().unwrap();
        let Some(series) = map.get(&(symbol.to_string(), timeframe)) else {
            bail!("no fixture series for {symbol} {timeframe}");
        };
        Ok(series.between(start_ms, end_ms))
    }
}

/// Deterministic bounded noise in [-1, 1] (multiplicative-hash style).
fn pseudo_noise(i: usize) -> f64 {
    let h = (i as u64)
        .wrapping_mul(2_654_435_761)
        .wrapping_add(987_654_321);
    let v = ((h >> 16) % 2_000) as f64;
    v / 1_000.0 - 1.0
}

/// A drifting series with deterministic wobble. The wobble keeps per-trade
/// returns from being identical (finite Sharpe) and gives the shuffle
/// tester real temporal structure to destroy.
pub fn wobble_series(
    symbol: &str,
    timeframe: Timeframe,
    days: u32,
    drift_per_bar: f64,
    wobble: f64,
    end_anchor: DateTime<Utc>,
) -> OhlcvSeries {
    let step = timeframe.bar_millis();
    let bars = (i64::from(days) * MS_PER_DAY / step) as usize;
    let end = end_anchor.timestamp_millis() / step * step;
    let start = end - bars as i64 * step;
    build_series(symbol, timeframe, start, step, bars, |i| {
        100.0 * (1.0 + drift_per_bar).powi(i as i32) * (1.0 + wobble * pseudo_noise(i))
    })
}

/// Drifting for the first `drift_days`, then flat (wobble only) — the
/// overfit fixture: the edge exists in sample and vanishes out of sample.
pub fn two_phase_series(
    symbol: &str,
    timeframe: Timeframe,
    drift_days: u32,
    flat_days: u32,
    drift_per_bar: f64,
    wobble: f64,
    end_anchor: DateTime<Utc>,
) -> OhlcvSeries {
    let step = timeframe.bar_millis();
    let drift_bars = (i64::from(drift_days) * MS_PER_DAY / step) as usize;
    let flat_bars = (i64::from(flat_days) * MS_PER_DAY / step) as usize;
    let bars = drift_bars + flat_bars;
    let end = end_anchor.timestamp_millis() / step * step;
    let start = end - bars as i64 * step;
    let plateau = 100.0 * (1.0 + drift_per_bar).powi(drift_bars as i32);
    build_series(symbol, timeframe, start, step, bars, move |i| {
        let base = if i < drift_bars {
            100.0 * (1.0 + drift_per_bar).powi(i as i32)
        } else {
            plateau
        };
        base * (1.0 + wobble * pseudo_noise(i))
    })
}

fn build_series(
    symbol: &str,
    timeframe: Timeframe,
    start: i64,
    step: i64,
    bars: usize,
    close_fn: impl Fn(usize) -> f64,
) -> OhlcvSeries {
    let closes: Vec<f64> = (0..bars).map(close_fn).collect();
    let mut open = vec![closes[0]];
    open.extend_from_slice(&closes[..bars - 1]);
    OhlcvSeries {
        symbol: symbol.to_string(),
        timeframe,
        ts: (0..bars).map(|i| start + i as i64 * step).collect(),
        open: open.clone(),
        high: closes
            .iter()
            .zip(open.iter())
            .map(|(c, o)| c.max(*o) * 1.001)
            .collect(),
        low: closes
            .iter()
            .zip(open.iter())
            .map(|(c, o)| c.min(*o) * 0.999)
            .collect(),
        close: closes,
        volume: vec![100.0; bars],
    }
}

/// Trend-following blob: order-sensitive, so it survives the shuffle test.
pub const MOMENTUM_BLOB: &str = r#"
if i < 12 {
    "hold"
} else if close[i] > close[i - 12] {
    "open_long"
} else if close[i] < close[i - 12] * 0.995 {
    "open_short"
} else {
    "hold"
}
"#;

pub fn registry_from(config: &Config) -> perpfunnel::market::StaticCoinRegistry {
    perpfunnel::market::StaticCoinRegistry::new(
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
    )
}

pub fn validated_candidate(id: &str, blob: &str, fingerprint: &str) -> Candidate {
    Candidate {
        id: id.to_string(),
        name: format!("FRE-{id:0>8}"),
        code_blob: blob.to_string(),
        code_fingerprint: fingerprint.to_string(),
        timeframe: Timeframe::M15,
        source_class: SourceClass::Free,
        pattern: None,
        status: CandidateStatus::Validated,
        parameters: None,
        score_backtest: None,
        created_at: anchor(),
        last_evaluated_at: None,
    }
}
