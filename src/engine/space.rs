use crate::market::series::Timeframe;
use crate::strategy::{Candidate, ExecutionType, PatternMeta, TradeParams};

/// Leverage grid, shared by every construction mode.
pub const LEVERAGE_GRID: [f64; 7] = [1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 40.0];

struct AbsoluteGrid {
    sl: &'static [f64],
    tp: &'static [f64],
    exit: &'static [u32],
}

/// Curated per-timeframe grids for candidates without pattern metadata.
/// SL/TP are price fractions; exits are bar counts (0 = disabled).
fn absolute_grid(timeframe: Timeframe) -> AbsoluteGrid {
    match timeframe {
        Timeframe::M5 => AbsoluteGrid {
            sl: &[0.005, 0.010, 0.015, 0.020, 0.025],
            tp: &[0.0, 0.01, 0.02, 0.03, 0.04, 0.05],
            exit: &[0, 50, 100, 150, 200],
        },
        Timeframe::M15 => AbsoluteGrid {
            sl: &[0.01, 0.02, 0.03, 0.04, 0.05],
            tp: &[0.0, 0.02, 0.04, 0.06, 0.08, 0.10],
            exit: &[0, 25, 50, 75, 100],
        },
        Timeframe::M30 => AbsoluteGrid {
            sl: &[0.01, 0.02, 0.03, 0.04, 0.06],
            tp: &[0.0, 0.02, 0.04, 0.06, 0.09, 0.12],
            exit: &[0, 20, 40, 60, 80],
        },
        Timeframe::H1 => AbsoluteGrid {
            sl: &[0.02, 0.03, 0.04, 0.06, 0.08],
            tp: &[0.0, 0.03, 0.06, 0.09, 0.12, 0.15],
            exit: &[0, 12, 24, 48, 72],
        },
        Timeframe::H2 => AbsoluteGrid {
            sl: &[0.02, 0.04, 0.06, 0.08, 0.10],
            tp: &[0.0, 0.04, 0.08, 0.12, 0.16, 0.20],
            exit: &[0, 12, 24, 36, 48],
        },
    }
}

/// Enumerate the finite parameter space for a candidate.
///
/// Construction mode follows the metadata: pattern candidates use grids
/// anchored on their measured magnitude and holding period (split by
/// execution type), everything else gets the absolute per-timeframe grid.
/// Tuples with no exit condition besides the stop (`tp = 0` and
/// `exit_bars = 0`) are never emitted.
pub fn build_space(candidate: &Candidate) -> Vec<TradeParams> {
    let tuples = match &candidate.pattern {
        Some(meta) => match meta.execution_type {
            Some(ExecutionType::TouchBased) => touch_space(meta),
            Some(ExecutionType::CloseBased) => close_space(meta),
            None => centered_space(meta),
        },
        None => {
            let grid = absolute_grid(candidate.timeframe);
            cross(grid.sl, grid.tp, grid.exit)
        }
    };

    tuples
        .into_iter()
        .filter(|p| !(p.tp_pct == 0.0 && p.exit_bars == 0))
        .collect()
}

/// Touch-validated patterns target the measured level: TP scales around the
/// magnitude (zero excluded), SL sits beyond it.
fn touch_space(meta: &PatternMeta) -> Vec<TradeParams> {
    let tp: Vec<f64> = [0.50, 0.75, 1.00, 1.25, 1.50]
        .iter()
        .map(|m| m * meta.base_tp_magnitude)
        .collect();
    let sl: Vec<f64> = [1.00, 1.50, 2.00, 2.50]
        .iter()
        .map(|m| m * meta.base_tp_magnitude)
        .collect();
    let exit: Vec<u32> = [0.0, 1.00, 1.50, 2.00]
        .iter()
        .map(|m| scale_bars(meta.base_holding_bars, *m))
        .collect();
    cross(&sl, &tp, &exit)
}

/// Close-validated patterns ride a holding period: TP is disabled, the time
/// exit is primary (zero excluded) and SL is wide. The SL multipliers are
/// the magnitude fallback for the volatility-derived stops the pattern
/// miner would supply.
fn close_space(meta: &PatternMeta) -> Vec<TradeParams> {
    let sl: Vec<f64> = [4.0, 6.0, 8.0, 10.0]
        .iter()
        .map(|m| m * meta.base_tp_magnitude)
        .collect();
    let exit: Vec<u32> = [0.50, 0.75, 1.00, 1.25, 1.50]
        .iter()
        .map(|m| scale_bars(meta.base_holding_bars, *m).max(1))
        .collect();
    cross(&sl, &[0.0], &exit)
}

/// Fallback for pattern candidates lacking an execution type: grids centered
/// on the pattern's own numbers, SL anchored on magnitude × RR.
fn centered_space(meta: &PatternMeta) -> Vec<TradeParams> {
    let base_sl = meta.base_tp_magnitude * meta.suggested_rr_ratio;
    let tp: Vec<f64> = [0.0, 0.50, 0.75, 1.00, 1.25, 1.50]
        .iter()
        .map(|m| m * meta.base_tp_magnitude)
        .collect();
    let sl: Vec<f64> = [0.50, 0.75, 1.00, 1.50, 2.00]
        .iter()
        .map(|m| m * base_sl)
        .collect();
    let exit: Vec<u32> = [0.0, 0.50, 1.00, 1.50, 2.00]
        .iter()
        .map(|m| scale_bars(meta.base_holding_bars, *m))
        .collect();
    cross(&sl, &tp, &exit)
}

fn scale_bars(base: u32, mult: f64) -> u32 {
    (f64::from(base) * mult).round() as u32
}

fn cross(sl: &[f64], tp: &[f64], exit: &[u32]) -> Vec<TradeParams> {
    let mut out = Vec::with_capacity(sl.len() * tp.len() * exit.len() * LEVERAGE_GRID.len());
    for &sl_pct in sl {
        for &tp_pct in tp {
            for &exit_bars in exit {
                for &leverage in &LEVERAGE_GRID {
                    out.push(TradeParams {
                        sl_pct,
                        tp_pct,
                        leverage,
                        exit_bars,
                    });
                }
            }
        }
    }
    out
}
