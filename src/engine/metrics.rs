use super::types::{EquityPoint, KernelResult, Trade};

/// Annualized-Sharpe ceiling. Low-trade series with near-zero dispersion
/// would otherwise produce infinities.
pub fn sharpe_cap() -> f64 {
    250.0_f64.sqrt()
}

/// Trade-level metrics extracted from the trade log.
struct TradeMetrics {
    win_rate: f64,
    expectancy: f64,
    sharpe_raw: f64,
}

/// Fold a finished simulation into the kernel's metric block.
///
/// Clamps per the kernel contract: `max_drawdown` in [0, 1], sharpe capped
/// at √250 and forced non-positive whenever `total_return < 0`. Numeric
/// anomalies never escape as NaN/∞.
pub fn summarize(
    trades: Vec<Trade>,
    equity_curve: &[EquityPoint],
    initial_equity: f64,
    final_equity: f64,
) -> KernelResult {
    if trades.is_empty() {
        return KernelResult::empty();
    }

    let tm = compute_trade_metrics(&trades);
    let total_return = (final_equity - initial_equity) / initial_equity;
    let max_drawdown = max_drawdown(equity_curve).clamp(0.0, 1.0);

    let mut sharpe = tm.sharpe_raw.min(sharpe_cap());
    if total_return < 0.0 {
        sharpe = sharpe.min(0.0);
    }

    KernelResult {
        sharpe,
        max_drawdown,
        win_rate: tm.win_rate,
        expectancy: tm.expectancy,
        total_return,
        total_trades: trades.len(),
        trades,
    }
}

fn compute_trade_metrics(trades: &[Trade]) -> TradeMetrics {
    let total = trades.len() as f64;
    let mut winner_count = 0usize;
    let mut loser_count = 0usize;
    let mut win_sum = 0.0_f64;
    let mut loss_sum = 0.0_f64;

    for t in trades {
        if t.pnl_fraction > 0.0 {
            winner_count += 1;
            win_sum += t.pnl_fraction;
        } else if t.pnl_fraction < 0.0 {
            loser_count += 1;
            loss_sum += t.pnl_fraction;
        }
    }

    let win_rate = winner_count as f64 / total;
    let avg_win = if winner_count > 0 {
        win_sum / winner_count as f64
    } else {
        0.0
    };
    let avg_loss_magnitude = if loser_count > 0 {
        (loss_sum / loser_count as f64).abs()
    } else {
        0.0
    };

    // Expectancy with pnl expressed as % of notional
    let expectancy = win_rate * avg_win - (1.0 - win_rate) * avg_loss_magnitude;

    TradeMetrics {
        win_rate,
        expectancy,
        sharpe_raw: annualized_trade_sharpe(trades),
    }
}

/// Annualized Sharpe over per-trade returns: mean/std · √250. A degenerate
/// all-identical return series maps to the cap when positive, zero otherwise.
fn annualized_trade_sharpe(trades: &[Trade]) -> f64 {
    if trades.len() < 2 {
        let r = trades.first().map_or(0.0, |t| t.pnl_fraction);
        return if r > 0.0 { sharpe_cap() } else { 0.0 };
    }

    let returns: Vec<f64> = trades.iter().map(|t| t.pnl_fraction).collect();
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
        / (returns.len() - 1) as f64;
    let std = variance.sqrt();

    if std < 1e-12 {
        return if mean > 0.0 { sharpe_cap() } else { 0.0 };
    }

    mean / std * 250.0_f64.sqrt()
}

fn max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
    let Some(first) = equity_curve.first() else {
        return 0.0;
    };
    let mut peak = first.equity;
    let mut max_dd = 0.0;

    for point in equity_curve {
        if point.equity > peak {
            peak = point.equity;
        }
        if peak > 0.0 {
            let dd = (peak - point.equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    max_dd
}
