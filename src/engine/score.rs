use super::evaluator::EvalOutcome;

/// Collapse a validated evaluation into the scalar [0, 100] the pool ranks
/// on. Normalizations match the sweep's: expectancy saturates at 10%,
/// Sharpe at 3. The OOS bonus/penalty from the evaluator scales the base
/// multiplicatively before the final clamp.
pub fn score(outcome: &EvalOutcome) -> f64 {
    let w = &outcome.weighted;
    let expectancy_norm = (w.expectancy / 0.10).clamp(0.0, 1.0);
    let sharpe_norm = (w.sharpe / 3.0).clamp(0.0, 1.0);
    let drawdown_norm = (1.0 - w.max_drawdown / 0.30).max(0.0);
    let recency_norm = (0.5 - outcome.degradation).clamp(0.0, 1.0);

    let base = (0.40 * expectancy_norm
        + 0.25 * sharpe_norm
        + 0.10 * w.win_rate
        + 0.15 * drawdown_norm
        + 0.10 * recency_norm)
        * 100.0;

    (base * (1.0 + outcome.oos_adjustment)).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::evaluator::WeightedMetrics;
    use crate::engine::types::KernelResult;

    fn outcome(weighted: WeightedMetrics, degradation: f64, adjustment: f64) -> EvalOutcome {
        EvalOutcome {
            is_result: KernelResult::empty(),
            oos_result: KernelResult::empty(),
            degradation,
            oos_adjustment: adjustment,
            weighted,
        }
    }

    fn metrics(sharpe: f64, dd: f64, wr: f64, expectancy: f64) -> WeightedMetrics {
        WeightedMetrics {
            sharpe,
            max_drawdown: dd,
            win_rate: wr,
            expectancy,
            total_return: 0.1,
            total_trades: 100.0,
        }
    }

    #[test]
    fn perfect_inputs_score_one_hundred() {
        let o = outcome(metrics(3.0, 0.0, 1.0, 0.10), -0.5, 0.0);
        assert!((score(&o) - 100.0).abs() < 1e-10);
    }

    #[test]
    fn known_mid_range_score() {
        // expectancy_norm 0.5, sharpe_norm 0.5, wr 0.5, dd_norm 0.5,
        // recency_norm 0.5 → base 50
        let o = outcome(metrics(1.5, 0.15, 0.5, 0.05), 0.0, 0.0);
        assert!((score(&o) - 50.0).abs() < 1e-10);
    }

    #[test]
    fn drawdown_norm_floors_at_zero() {
        let deep = outcome(metrics(1.5, 0.9, 0.5, 0.05), 0.0, 0.0);
        let shallow = outcome(metrics(1.5, 0.30, 0.5, 0.05), 0.0, 0.0);
        // dd 0.30 already zeroes the norm; deeper drawdowns cannot go lower
        assert!((score(&deep) - score(&shallow)).abs() < 1e-10);
    }

    #[test]
    fn oos_bonus_lifts_score() {
        let flat = outcome(metrics(1.5, 0.15, 0.5, 0.05), -0.3, 0.0);
        let boosted = outcome(metrics(1.5, 0.15, 0.5, 0.05), -0.3, 0.15);
        assert!(score(&boosted) > score(&flat));
    }

    #[test]
    fn degradation_penalty_reduces_score() {
        let fresh = outcome(metrics(1.5, 0.15, 0.5, 0.05), 0.0, 0.0);
        let degraded = outcome(metrics(1.5, 0.15, 0.5, 0.05), 0.45, -0.045);
        assert!(score(&degraded) < score(&fresh));
    }

    #[test]
    fn score_stays_in_range() {
        let o = outcome(metrics(10.0, 0.0, 1.0, 1.0), -5.0, 0.20);
        let s = score(&o);
        assert!((0.0..=100.0).contains(&s));
    }
}
