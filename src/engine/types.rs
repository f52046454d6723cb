use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn multiplier(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

/// Why a position was closed. Explicit close signals fold into `Time`;
/// the persisted reason set stays closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Time,
    EndOfSeries,
}

/// One closed trade from the simulation. `pnl_fraction` is the net return
/// as a fraction of notional, after slippage and fees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub entry_ts: i64,
    pub exit_ts: i64,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub notional: f64,
    pub pnl_fraction: f64,
    pub exit_reason: ExitReason,
}

/// Mark-to-market equity at one bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: i64,
    pub equity: f64,
}

/// Kernel output: the metric block plus the trade log for higher layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelResult {
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub expectancy: f64,
    pub total_return: f64,
    pub total_trades: usize,
    pub trades: Vec<Trade>,
}

impl KernelResult {
    /// The zero-trade result: a simulation where signals never produced a
    /// fill returns this rather than failing.
    pub fn empty() -> Self {
        Self {
            sharpe: 0.0,
            max_drawdown: 0.0,
            win_rate: 0.0,
            expectancy: 0.0,
            total_return: 0.0,
            total_trades: 0,
            trades: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_multiplier() {
        assert!((Direction::Long.multiplier() - 1.0).abs() < f64::EPSILON);
        assert!((Direction::Short.multiplier() + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_result_is_all_zero() {
        let r = KernelResult::empty();
        assert_eq!(r.total_trades, 0);
        assert!(r.trades.is_empty());
        assert!((r.sharpe - 0.0).abs() < f64::EPSILON);
    }
}
