//! Generate deterministic synthetic OHLCV parquet fixtures and seed demo
//! candidates, so the funnel can run end-to-end without a live data feed.

use anyhow::Result;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use perpfunnel::config::{Config, CONFIG_ENV};
use perpfunnel::market::parquet::{write_series, ParquetSource};
use perpfunnel::market::series::{OhlcvSeries, Timeframe, MS_PER_DAY};
use perpfunnel::store::Store;
use perpfunnel::strategy::{Candidate, CandidateStatus, SourceClass};

const MOMENTUM_BLOB: &str = r#"
if i < 12 {
    "hold"
} else if close[i] > close[i - 12] * 1.004 {
    "open_long"
} else if close[i] < close[i - 12] * 0.996 {
    "open_short"
} else {
    "hold"
}
"#;

const BREAKOUT_BLOB: &str = r#"
if i < 24 {
    "hold"
} else {
    let top = high[i - 1];
    let bottom = low[i - 1];
    let j = 2;
    while j <= 24 {
        if high[i - j] > top { top = high[i - j]; }
        if low[i - j] < bottom { bottom = low[i - j]; }
        j += 1;
    }
    if close[i] > top {
        "open_long"
    } else if close[i] < bottom {
        "open_short"
    } else {
        "hold"
    }
}
"#;

const MEAN_REVERT_BLOB: &str = r#"
if i < 20 {
    "hold"
} else {
    let sum = 0.0;
    let j = 1;
    while j <= 20 {
        sum += close[i - j];
        j += 1;
    }
    let mean = sum / 20.0;
    if close[i] < mean * 0.99 {
        "open_long"
    } else if close[i] > mean * 1.01 {
        "open_short"
    } else {
        "hold"
    }
}
"#;

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config_path = std::env::var(CONFIG_ENV)
        .map_or_else(|_| PathBuf::from("perpfunnel.toml"), PathBuf::from);
    let config = Config::load(&config_path)?;

    let days = config.is.window_days + config.oos.window_days + config.shuffle.data_days;
    let source = ParquetSource::new(config.data.root.clone());

    let total = config.universe.coins.len() * Timeframe::ALL.len();
    let bar = ProgressBar::new(total as u64);
    bar.set_style(ProgressStyle::with_template(
        "{msg} [{bar:40}] {pos}/{len}",
    )?);
    bar.set_message("writing fixtures");

    let end_anchor = Utc::now().timestamp_millis();
    for coin in &config.universe.coins {
        for timeframe in Timeframe::ALL {
            let series = synthetic_series(&coin.symbol, timeframe, days, end_anchor);
            write_series(&source.file_path(&coin.symbol, timeframe), &series)?;
            bar.inc(1);
        }
    }
    bar.finish_with_message("fixtures written");

    let store = Store::open(Path::new(&config.data.store_path))?;
    let seeded = seed_candidates(&store)?;
    println!("seeded {seeded} validated candidates into {}", config.data.store_path);
    Ok(())
}

/// Geometric random walk with mild drift and a slow cycle, seeded per
/// (symbol, timeframe) so repeated runs produce identical files.
fn synthetic_series(
    symbol: &str,
    timeframe: Timeframe,
    days: u32,
    end_anchor_ms: i64,
) -> OhlcvSeries {
    let step = timeframe.bar_millis();
    let bars = i64::from(days) * MS_PER_DAY / step;
    let end = end_anchor_ms / step * step;
    let start = end - bars * step;

    let mut hasher = rustc_hash::FxHasher::default();
    (symbol, timeframe.as_str()).hash(&mut hasher);
    let mut rng = StdRng::seed_from_u64(hasher.finish());

    let mut price = 100.0 + rng.random_range(0.0..400.0);
    let drift = rng.random_range(-0.00002..0.00008);

    let n = bars as usize;
    let mut ts = Vec::with_capacity(n);
    let mut open = Vec::with_capacity(n);
    let mut high = Vec::with_capacity(n);
    let mut low = Vec::with_capacity(n);
    let mut close = Vec::with_capacity(n);
    let mut volume = Vec::with_capacity(n);

    for k in 0..bars {
        let bar_open = price;
        let cycle = (k as f64 / 600.0).sin() * 0.001;
        let noise = rng.random_range(-0.004..0.004);
        let bar_close = bar_open * (1.0 + drift + cycle + noise);
        let spread = bar_open.max(bar_close) * rng.random_range(0.0..0.002);

        ts.push(start + k * step);
        open.push(bar_open);
        high.push(bar_open.max(bar_close) + spread);
        low.push((bar_open.min(bar_close) - spread).max(0.01));
        close.push(bar_close);
        volume.push(rng.random_range(10.0..5_000.0));
        price = bar_close;
    }

    OhlcvSeries {
        symbol: symbol.to_string(),
        timeframe,
        ts,
        open,
        high,
        low,
        close,
        volume,
    }
}

fn seed_candidates(store: &Store) -> Result<usize> {
    let blobs = [
        (MOMENTUM_BLOB, SourceClass::Free, Timeframe::M15),
        (BREAKOUT_BLOB, SourceClass::IndicatorAssigned, Timeframe::H1),
        (MEAN_REVERT_BLOB, SourceClass::CatalogBased, Timeframe::M30),
    ];
    let mut seeded = 0;
    for (blob, source_class, timeframe) in blobs {
        let id = Uuid::new_v4().to_string();
        let suffix = &id[..8];
        let candidate = Candidate {
            id: id.clone(),
            name: format!("{}-{suffix}", source_class.tag()),
            code_blob: blob.to_string(),
            code_fingerprint: fingerprint(blob),
            timeframe,
            source_class,
            pattern: None,
            status: CandidateStatus::Validated,
            parameters: None,
            score_backtest: None,
            created_at: Utc::now(),
            last_evaluated_at: None,
        };
        store.insert_candidate(&candidate)?;
        seeded += 1;
    }
    Ok(seeded)
}

/// Stand-in for the generator's content hash of the base code.
fn fingerprint(blob: &str) -> String {
    let mut hasher = rustc_hash::FxHasher::default();
    blob.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
