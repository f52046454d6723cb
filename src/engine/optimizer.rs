use rayon::prelude::*;

use super::evaluator::{threshold_failure, Window};
use super::kernel::{run_portfolio, SimSettings, SymbolLane};
use super::space;
use super::types::KernelResult;
use crate::config::Config;
use crate::error::{KernelError, RejectReason};
use crate::strategy::{Candidate, TradeParams};

/// The winning parameter tuple from a sweep, with its in-sample result.
#[derive(Debug, Clone)]
pub struct OptimizedCombo {
    pub params: TradeParams,
    pub combo_score: f64,
    pub result: KernelResult,
}

/// Sweep-ranking score. Expectancy dominates; normalizations saturate at
/// 10% expectancy and a Sharpe of 3.
pub fn combo_score(result: &KernelResult) -> f64 {
    let edge_norm = (result.expectancy / 0.10).clamp(0.0, 1.0);
    let sharpe_norm = (result.sharpe / 3.0).clamp(0.0, 1.0);
    (0.50 * edge_norm
        + 0.25 * sharpe_norm
        + 0.15 * result.win_rate
        + 0.10 * (1.0 - result.max_drawdown))
        * 100.0
}

/// Run the parametric sweep for a candidate over its in-sample portfolio and
/// return the best surviving tuple.
///
/// The space is embarrassingly parallel within one candidate: tuples are
/// distributed across the thread pool and joined before the winner is
/// picked. Ties resolve to the earliest tuple in enumeration order so the
/// sweep stays deterministic.
pub fn optimize(
    candidate: &Candidate,
    is_lanes: &[SymbolLane],
    config: &Config,
) -> Result<OptimizedCombo, RejectReason> {
    let tuples = space::build_space(candidate);
    let settings = SimSettings::from_config(config, config.is.min_bars);

    // Structural data problems fail the candidate once, not per tuple.
    if let Some(lane) = is_lanes.first() {
        if lane.series.len() < settings.min_bars {
            return Err(RejectReason::InsufficientData);
        }
    } else {
        return Err(RejectReason::InsufficientData);
    }

    let min_trades = config.thresholds.min_combo_trades;
    let survivors: Vec<(usize, f64, TradeParams, KernelResult)> = tuples
        .par_iter()
        .enumerate()
        .filter_map(|(idx, params)| {
            let result = match run_portfolio(is_lanes, params, &settings) {
                Ok(r) => r,
                Err(KernelError::InsufficientData { .. }) => return None,
                Err(e) => {
                    tracing::warn!(candidate = %candidate.id, error = %e, "kernel run failed");
                    return None;
                }
            };
            if threshold_failure(&result, config, min_trades, Window::InSample).is_some() {
                return None;
            }
            Some((idx, combo_score(&result), *params, result))
        })
        .collect();

    let best = survivors.into_iter().max_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            // Lower enumeration index wins ties
            .then(b.0.cmp(&a.0))
    });

    match best {
        Some((_, score, params, result)) => {
            tracing::debug!(
                candidate = %candidate.id,
                combo_score = score,
                sl = params.sl_pct,
                tp = params.tp_pct,
                leverage = params.leverage,
                exit_bars = params.exit_bars,
                "sweep winner"
            );
            Ok(OptimizedCombo {
                params,
                combo_score: score,
                result,
            })
        }
        None => Err(RejectReason::NoComboPassed),
    }
}
