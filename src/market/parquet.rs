use anyhow::{bail, Context, Result};
use polars::prelude::*;
use std::path::{Path, PathBuf};

use super::series::{OhlcvSeries, Timeframe};
use super::MarketData;

/// The canonical bar-open timestamp column name.
pub const TS_COL: &str = "ts";

/// Market data source reading per-(symbol, timeframe) parquet files from a
/// root directory, laid out as `<root>/<SYMBOL>_<timeframe>.parquet`.
pub struct ParquetSource {
    root: PathBuf,
}

impl ParquetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn file_path(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.root.join(format!("{symbol}_{timeframe}.parquet"))
    }
}

impl MarketData for ParquetSource {
    fn get_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<OhlcvSeries> {
        let path = self.file_path(symbol, timeframe);
        let df = read_ohlcv_frame(&path)?;
        let series = frame_to_series(&df, symbol, timeframe)?;
        Ok(series.between(start_ms, end_ms))
    }
}

fn read_ohlcv_frame(path: &Path) -> Result<DataFrame> {
    if !path.exists() {
        bail!("no market data file at {}", path.display());
    }
    let path_str = path.to_string_lossy().to_string();
    let df = LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())?
        .collect()
        .with_context(|| format!("failed to read parquet file {}", path.display()))?;
    Ok(df)
}

/// Extract flat OHLCV columns from a frame. The timestamp column may be
/// Datetime (any unit) or plain Int64 epoch-ms; bars must be strictly
/// increasing (the provider contract is gap-free, monotonic, UTC).
pub fn frame_to_series(df: &DataFrame, symbol: &str, timeframe: Timeframe) -> Result<OhlcvSeries> {
    let ts = extract_epoch_ms(df.column(TS_COL)?)?;
    let open = column_f64(df, "open")?;
    let high = column_f64(df, "high")?;
    let low = column_f64(df, "low")?;
    let close = column_f64(df, "close")?;
    let volume = column_f64(df, "volume")?;

    if ts.windows(2).any(|w| w[1] <= w[0]) {
        bail!("timestamps for {symbol} are not strictly increasing");
    }

    Ok(OhlcvSeries {
        symbol: symbol.to_string(),
        timeframe,
        ts,
        open,
        high,
        low,
        close,
        volume,
    })
}

fn column_f64(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    Ok(df.column(name)?.f64()?.into_no_null_iter().collect())
}

fn extract_epoch_ms(col: &Column) -> Result<Vec<i64>> {
    match col.dtype() {
        DataType::Int64 => Ok(col.i64()?.into_no_null_iter().collect()),
        DataType::Datetime(tu, _) => {
            let raw: Vec<i64> = col.datetime()?.phys.into_no_null_iter().collect();
            let ms = match tu {
                TimeUnit::Milliseconds => raw,
                TimeUnit::Microseconds => raw.into_iter().map(|v| v / 1_000).collect(),
                TimeUnit::Nanoseconds => raw.into_iter().map(|v| v / 1_000_000).collect(),
            };
            Ok(ms)
        }
        other => bail!("unsupported timestamp column type: {other:?}"),
    }
}

/// Build a frame from a series and write it as parquet (used by the seed
/// tooling and tests). The timestamp is stored as Datetime(ms).
pub fn write_series(path: &Path, series: &OhlcvSeries) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data dir {}", parent.display()))?;
    }
    let mut df = df! {
        TS_COL => &series.ts,
        "open" => &series.open,
        "high" => &series.high,
        "low" => &series.low,
        "close" => &series.close,
        "volume" => &series.volume,
    }?
    .lazy()
    .with_column(col(TS_COL).cast(DataType::Datetime(TimeUnit::Milliseconds, None)))
    .collect()?;

    let file = std::fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    ParquetWriter::new(file).finish(&mut df)?;
    Ok(())
}
