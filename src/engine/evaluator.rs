use super::kernel::{run_portfolio, SimSettings, SymbolLane};
use super::types::KernelResult;
use crate::config::Config;
use crate::error::{KernelError, RejectReason};
use crate::market::series::Timeframe;
use crate::strategy::TradeParams;

/// Which evaluation window a threshold check applies to; decides the reason
/// tag reported on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    InSample,
    OutOfSample,
}

/// The five-threshold check shared by the sweep and the evaluator. Returns
/// the first breached threshold in the canonical order trades, sharpe,
/// win-rate, expectancy, drawdown.
pub fn threshold_failure(
    result: &KernelResult,
    config: &Config,
    min_trades: usize,
    window: Window,
) -> Option<RejectReason> {
    let t = &config.thresholds;
    let is_window = window == Window::InSample;

    if result.total_trades < min_trades {
        return Some(if is_window {
            RejectReason::IsTradesTooFew
        } else {
            RejectReason::OosTradesTooFew
        });
    }
    if result.sharpe < t.sharpe {
        return Some(if is_window {
            RejectReason::IsSharpeTooLow
        } else {
            RejectReason::OosSharpeTooLow
        });
    }
    if result.win_rate < t.win_rate {
        return Some(if is_window {
            RejectReason::IsWinRateTooLow
        } else {
            RejectReason::OosWinRateTooLow
        });
    }
    if result.expectancy < t.expectancy {
        return Some(if is_window {
            RejectReason::IsExpectancyTooLow
        } else {
            RejectReason::OosExpectancyTooLow
        });
    }
    if result.max_drawdown > t.max_drawdown {
        return Some(if is_window {
            RejectReason::IsDrawdownTooHigh
        } else {
            RejectReason::OosDrawdownTooHigh
        });
    }
    None
}

/// IS and OOS results blended 0.4/0.6 (recency weighting), with the
/// degradation diagnostics the scorer consumes.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub is_result: KernelResult,
    pub oos_result: KernelResult,
    /// `(is_sharpe − oos_sharpe) / is_sharpe`; negative when OOS improved.
    pub degradation: f64,
    /// Score adjustment: a bonus in [0, 0.20] when OOS held up, a penalty
    /// down to −0.05 when it degraded.
    pub oos_adjustment: f64,
    pub weighted: WeightedMetrics,
}

#[derive(Debug, Clone, Copy)]
pub struct WeightedMetrics {
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub expectancy: f64,
    pub total_return: f64,
    pub total_trades: f64,
}

/// Run the chosen parameters over the IS then OOS windows and enforce the
/// degradation policy. Every rejection carries a typed reason; callers
/// delete the candidate on any of them.
pub fn evaluate(
    is_lanes: &[SymbolLane],
    oos_lanes: &[SymbolLane],
    params: &TradeParams,
    timeframe: Timeframe,
    config: &Config,
) -> Result<EvalOutcome, RejectReason> {
    let floor = config.trade_floor(timeframe);

    let is_settings = SimSettings::from_config(config, config.is.min_bars);
    let is_result = match run_portfolio(is_lanes, params, &is_settings) {
        Ok(r) => r,
        Err(KernelError::InsufficientData { .. }) => return Err(RejectReason::InsufficientData),
        Err(e) => {
            tracing::warn!(error = %e, "in-sample kernel failure");
            return Err(RejectReason::InsufficientData);
        }
    };
    if is_result.total_trades == 0 {
        return Err(RejectReason::ZeroTradesInSample);
    }
    if let Some(reason) = threshold_failure(&is_result, config, floor.is, Window::InSample) {
        return Err(reason);
    }

    let oos_settings = SimSettings::from_config(config, config.oos.min_bars);
    let oos_result = match run_portfolio(oos_lanes, params, &oos_settings) {
        Ok(r) => r,
        Err(KernelError::InsufficientData { .. }) => return Err(RejectReason::InsufficientData),
        Err(e) => {
            tracing::warn!(error = %e, "out-of-sample kernel failure");
            return Err(RejectReason::InsufficientData);
        }
    };
    if let Some(reason) = threshold_failure(&oos_result, config, floor.oos, Window::OutOfSample) {
        return Err(reason);
    }

    // IS sharpe cleared its threshold (> 0), so the ratio is well-defined.
    let degradation = (is_result.sharpe - oos_result.sharpe) / is_result.sharpe;
    if degradation > config.oos.max_degradation {
        return Err(RejectReason::OosOverfitted);
    }

    let oos_adjustment = if oos_result.sharpe >= is_result.sharpe {
        (degradation.abs() * 0.5).min(0.20)
    } else {
        -(degradation * 0.10)
    };

    let blend = |is_v: f64, oos_v: f64| 0.4 * is_v + 0.6 * oos_v;
    let weighted = WeightedMetrics {
        sharpe: blend(is_result.sharpe, oos_result.sharpe),
        max_drawdown: blend(is_result.max_drawdown, oos_result.max_drawdown),
        win_rate: blend(is_result.win_rate, oos_result.win_rate),
        expectancy: blend(is_result.expectancy, oos_result.expectancy),
        total_return: blend(is_result.total_return, oos_result.total_return),
        total_trades: blend(is_result.total_trades as f64, oos_result.total_trades as f64),
    };

    Ok(EvalOutcome {
        is_result,
        oos_result,
        degradation,
        oos_adjustment,
        weighted,
    })
}
