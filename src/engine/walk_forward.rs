use anyhow::Result;

use super::kernel::{run_portfolio, SimSettings, SymbolLane};
use crate::config::Config;
use crate::error::KernelError;
use crate::market::series::OhlcvSeries;
use crate::market::Coin;
use crate::strategy::script::ScriptStrategy;
use crate::strategy::TradeParams;

/// One expanding window's outcome.
#[derive(Debug, Clone, Copy)]
pub struct WindowResult {
    pub fraction: f64,
    pub expectancy: f64,
    pub total_trades: usize,
    pub profitable: bool,
}

/// Walk-forward report: per-window results plus the pass/fail tally.
#[derive(Debug, Clone)]
pub struct WfaReport {
    pub windows: Vec<WindowResult>,
    pub passed: u32,
    pub required: u32,
}

impl WfaReport {
    pub fn pass(&self) -> bool {
        self.passed >= self.required
    }
}

/// Expanding-window consistency check with parameters held fixed.
///
/// Each window is a prefix slice of the in-sample portfolio; signals are
/// recomputed on the slice so every window sees exactly the data it would
/// have had at the time. There is no re-optimization and nothing here is
/// cacheable — the outcome depends on the parameters embedded in the
/// candidate.
pub fn validate(
    program: &ScriptStrategy,
    is_data: &[(OhlcvSeries, Coin)],
    params: &TradeParams,
    config: &Config,
) -> Result<WfaReport> {
    let settings = SimSettings::from_config(config, config.oos.min_bars);
    let mut windows = Vec::with_capacity(config.wfa.window_percentages.len());
    let mut passed = 0u32;

    for &fraction in &config.wfa.window_percentages {
        let slices: Vec<OhlcvSeries> = is_data
            .iter()
            .map(|(series, _)| series.prefix_fraction(fraction))
            .collect();
        let signal_sets: Vec<Vec<crate::strategy::Signal>> = slices
            .iter()
            .map(|s| program.signals(s))
            .collect::<Result<_>>()?;
        let lanes: Vec<SymbolLane> = slices
            .iter()
            .zip(signal_sets.iter())
            .zip(is_data.iter())
            .map(|((series, signals), (_, coin))| SymbolLane {
                series,
                signals,
                coin,
            })
            .collect();

        let (expectancy, total_trades, profitable) =
            match run_portfolio(&lanes, params, &settings) {
                Ok(result) => {
                    let ok = result.total_trades > 0
                        && result.expectancy >= config.wfa.min_expectancy;
                    (result.expectancy, result.total_trades, ok)
                }
                Err(KernelError::InsufficientData { .. }) => (0.0, 0, false),
                Err(e) => return Err(e.into()),
            };

        if profitable {
            passed += 1;
        }
        windows.push(WindowResult {
            fraction,
            expectancy,
            total_trades,
            profitable,
        });
    }

    Ok(WfaReport {
        windows,
        passed,
        required: config.wfa.min_profitable_windows,
    })
}
