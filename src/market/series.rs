use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Milliseconds in one day.
pub const MS_PER_DAY: i64 = 86_400_000;

/// The fixed set of bar intervals candidates are assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
}

impl Timeframe {
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
    ];

    pub fn minutes(self) -> i64 {
        match self {
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H2 => 120,
        }
    }

    pub fn bar_millis(self) -> i64 {
        self.minutes() * 60_000
    }

    pub fn bars_per_day(self) -> usize {
        (MS_PER_DAY / self.bar_millis()) as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
        }
    }

    pub fn parse(s: &str) -> Option<Timeframe> {
        match s {
            "5m" => Some(Timeframe::M5),
            "15m" => Some(Timeframe::M15),
            "30m" => Some(Timeframe::M30),
            "1h" => Some(Timeframe::H1),
            "2h" => Some(Timeframe::H2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gap-free OHLCV series for one (symbol, timeframe), stored as flat columns.
/// Timestamps are bar-open epoch milliseconds, UTC, strictly increasing.
#[derive(Debug, Clone, PartialEq)]
pub struct OhlcvSeries {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub ts: Vec<i64>,
    pub open: Vec<f64>,
    pub high: Vec<f64>,
    pub low: Vec<f64>,
    pub close: Vec<f64>,
    pub volume: Vec<f64>,
}

impl OhlcvSeries {
    pub fn len(&self) -> usize {
        self.ts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ts.is_empty()
    }

    /// First and last bar-open timestamps, or `None` when empty.
    pub fn span(&self) -> Option<(i64, i64)> {
        Some((*self.ts.first()?, *self.ts.last()?))
    }

    /// Clone a contiguous row range into a new series.
    pub fn slice(&self, start: usize, end: usize) -> OhlcvSeries {
        OhlcvSeries {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            ts: self.ts[start..end].to_vec(),
            open: self.open[start..end].to_vec(),
            high: self.high[start..end].to_vec(),
            low: self.low[start..end].to_vec(),
            close: self.close[start..end].to_vec(),
            volume: self.volume[start..end].to_vec(),
        }
    }

    /// Prefix covering the first `fraction` of the series (expanding-window
    /// slicing). `fraction` is clamped to [0, 1].
    pub fn prefix_fraction(&self, fraction: f64) -> OhlcvSeries {
        let f = fraction.clamp(0.0, 1.0);
        let end = (self.len() as f64 * f).round() as usize;
        self.slice(0, end.min(self.len()))
    }

    /// Rows with bar-open timestamp in `[start_ms, end_ms)`.
    pub fn between(&self, start_ms: i64, end_ms: i64) -> OhlcvSeries {
        let start = self.ts.partition_point(|&t| t < start_ms);
        let end = self.ts.partition_point(|&t| t < end_ms);
        self.slice(start, end)
    }

    /// Split into (in-sample, out-of-sample) windows: the most recent
    /// `oos_days` ending at the last bar are OOS, the preceding `is_days`
    /// are IS. The windows never overlap; the split is a single row index.
    pub fn split_is_oos(&self, is_days: u32, oos_days: u32) -> Result<(OhlcvSeries, OhlcvSeries)> {
        let Some((_, last)) = self.span() else {
            bail!("cannot split an empty series");
        };
        let end_ms = last + self.timeframe.bar_millis();
        let oos_start = end_ms - i64::from(oos_days) * MS_PER_DAY;
        let is_start = oos_start - i64::from(is_days) * MS_PER_DAY;

        let split = self.ts.partition_point(|&t| t < oos_start);
        let is_begin = self.ts.partition_point(|&t| t < is_start);
        if is_begin >= split || split >= self.len() {
            bail!(
                "series for {} too short for a {}d/{}d split ({} bars)",
                self.symbol,
                is_days,
                oos_days,
                self.len()
            );
        }
        Ok((self.slice(is_begin, split), self.slice(split, self.len())))
    }

    /// The trailing `days` of the series.
    pub fn tail_days(&self, days: u32) -> OhlcvSeries {
        match self.span() {
            Some((_, last)) => {
                let cutoff = last + self.timeframe.bar_millis() - i64::from(days) * MS_PER_DAY;
                let start = self.ts.partition_point(|&t| t < cutoff);
                self.slice(start, self.len())
            }
            None => self.clone(),
        }
    }

    /// Reorder rows by `indices` (used by the shuffle tester). Timestamps
    /// keep their original positions so the permuted series still looks like
    /// a well-formed timeline to the strategy.
    pub fn permute_rows(&self, indices: &[usize]) -> OhlcvSeries {
        debug_assert_eq!(indices.len(), self.len());
        OhlcvSeries {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            ts: self.ts.clone(),
            open: indices.iter().map(|&i| self.open[i]).collect(),
            high: indices.iter().map(|&i| self.high[i]).collect(),
            low: indices.iter().map(|&i| self.low[i]).collect(),
            close: indices.iter().map(|&i| self.close[i]).collect(),
            volume: indices.iter().map(|&i| self.volume[i]).collect(),
        }
    }

    /// True when `other` shares this series' timeline exactly.
    pub fn aligned_with(&self, other: &OhlcvSeries) -> bool {
        self.timeframe == other.timeframe && self.ts == other.ts
    }
}
