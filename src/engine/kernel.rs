use super::metrics;
use super::types::{Direction, EquityPoint, ExitReason, KernelResult, Trade};
use crate::config::Config;
use crate::error::KernelError;
use crate::market::series::OhlcvSeries;
use crate::market::Coin;
use crate::strategy::{Signal, TradeParams};

/// One symbol's inputs to a portfolio simulation: the bar series, the
/// precomputed per-bar signal sequence, and the coin's exchange limits.
pub struct SymbolLane<'a> {
    pub series: &'a OhlcvSeries,
    pub signals: &'a [Signal],
    pub coin: &'a Coin,
}

/// Kernel-level simulation settings, fixed for a whole funnel run.
#[derive(Debug, Clone)]
pub struct SimSettings {
    pub initial_equity: f64,
    pub risk_per_trade_pct: f64,
    pub max_concurrent_positions: u32,
    pub fee_rate: f64,
    pub slippage_pct: f64,
    pub min_notional: f64,
    /// Caller's contract: minimum bars per lane for this invocation.
    pub min_bars: usize,
}

impl SimSettings {
    pub fn from_config(config: &Config, min_bars: usize) -> Self {
        Self {
            initial_equity: config.sim.initial_equity,
            risk_per_trade_pct: config.risk.per_trade_pct,
            max_concurrent_positions: config.risk.max_concurrent_positions,
            fee_rate: config.exchange.fee_rate,
            slippage_pct: config.exchange.slippage_pct,
            min_notional: config.exchange.min_notional,
            min_bars,
        }
    }
}

struct OpenPosition {
    direction: Direction,
    entry_index: usize,
    entry_ts: i64,
    entry_fill: f64,
    notional: f64,
    margin: f64,
}

/// Deterministic bar-by-bar portfolio simulation over aligned symbol lanes.
///
/// Signals are evaluated at bar close and filled at the next bar's open;
/// exits are checked against each bar's close in priority order stop-loss,
/// take-profit, time, end-of-series. Slippage applies adversely on every
/// fill and the fee rate is charged on notional at entry and exit.
///
/// A run with no fills returns [`KernelResult::empty`]; only structural
/// problems (too few bars, misaligned lanes, bad parameters) are errors.
pub fn run_portfolio(
    lanes: &[SymbolLane],
    params: &TradeParams,
    settings: &SimSettings,
) -> Result<KernelResult, KernelError> {
    if params.sl_pct <= 0.0 {
        return Err(KernelError::InvalidParams("sl_pct must be positive"));
    }
    if params.leverage < 1.0 {
        return Err(KernelError::InvalidParams("leverage must be at least 1"));
    }
    let Some(first) = lanes.first() else {
        return Err(KernelError::InsufficientData {
            required: settings.min_bars,
            available: 0,
        });
    };
    for lane in lanes {
        if lane.series.len() < settings.min_bars {
            return Err(KernelError::InsufficientData {
                required: settings.min_bars,
                available: lane.series.len(),
            });
        }
        if lane.signals.len() != lane.series.len() || !lane.series.aligned_with(first.series) {
            return Err(KernelError::MisalignedSeries);
        }
    }

    let n = first.series.len();
    let slip = settings.slippage_pct;
    let round_trip_fees = 2.0 * settings.fee_rate;

    let mut equity = settings.initial_equity;
    let mut margin_in_use = 0.0_f64;
    let mut open: Vec<Option<OpenPosition>> = (0..lanes.len()).map(|_| None).collect();
    let mut trades: Vec<Trade> = Vec::new();
    let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(n);

    for i in 0..n {
        // Phase 1: explicit close signals from the previous bar, filled at
        // this bar's open.
        if i > 0 {
            for (li, lane) in lanes.iter().enumerate() {
                if lane.signals[i - 1] != Signal::Close {
                    continue;
                }
                if let Some(position) = open[li].take() {
                    let exit_fill = adverse_fill(lane.series.open[i], position.direction, slip, false);
                    settle(
                        &mut equity,
                        &mut margin_in_use,
                        &mut trades,
                        lane,
                        position,
                        lane.series.ts[i],
                        exit_fill,
                        round_trip_fees,
                        ExitReason::Time,
                    );
                }
            }
        }

        // Phase 2: entries from the previous bar's signals at this bar's open.
        if i > 0 {
            for (li, lane) in lanes.iter().enumerate() {
                if open[li].is_some() || !lane.coin.tradable {
                    continue;
                }
                let direction = match lane.signals[i - 1] {
                    Signal::OpenLong => Direction::Long,
                    Signal::OpenShort => Direction::Short,
                    Signal::Close | Signal::Hold => continue,
                };
                let open_count = open.iter().flatten().count() as u32;
                if open_count >= settings.max_concurrent_positions {
                    continue;
                }
                if let Some(position) = size_entry(
                    lane,
                    direction,
                    i,
                    equity,
                    margin_in_use,
                    params,
                    settings,
                ) {
                    margin_in_use += position.margin;
                    open[li] = Some(position);
                }
            }
        }

        // Phase 3: threshold exits against this bar's close.
        let last_bar = i == n - 1;
        for (li, lane) in lanes.iter().enumerate() {
            let Some(position) = &open[li] else { continue };
            let close = lane.series.close[i];
            let direction = position.direction;
            let bars_held = i - position.entry_index;

            let sl_hit = match direction {
                Direction::Long => close <= position.entry_fill * (1.0 - params.sl_pct),
                Direction::Short => close >= position.entry_fill * (1.0 + params.sl_pct),
            };
            let tp_hit = params.tp_pct > 0.0
                && match direction {
                    Direction::Long => close >= position.entry_fill * (1.0 + params.tp_pct),
                    Direction::Short => close <= position.entry_fill * (1.0 - params.tp_pct),
                };
            let time_hit = params.exit_bars > 0 && bars_held >= params.exit_bars as usize;

            let reason = if sl_hit {
                Some(ExitReason::StopLoss)
            } else if tp_hit {
                Some(ExitReason::TakeProfit)
            } else if time_hit {
                Some(ExitReason::Time)
            } else if last_bar {
                Some(ExitReason::EndOfSeries)
            } else {
                None
            };

            if let Some(reason) = reason {
                let position = open[li].take().unwrap_or_else(|| unreachable!());
                let exit_fill = adverse_fill(close, direction, slip, false);
                settle(
                    &mut equity,
                    &mut margin_in_use,
                    &mut trades,
                    lane,
                    position,
                    lane.series.ts[i],
                    exit_fill,
                    round_trip_fees,
                    reason,
                );
            }
        }

        // Phase 4: mark-to-market equity point for drawdown tracking.
        let unrealized: f64 = lanes
            .iter()
            .zip(open.iter())
            .filter_map(|(lane, slot)| {
                slot.as_ref().map(|p| {
                    p.direction.multiplier() * (lane.series.close[i] - p.entry_fill)
                        / p.entry_fill
                        * p.notional
                })
            })
            .sum();
        equity_curve.push(EquityPoint {
            ts: first.series.ts[i],
            equity: equity + unrealized,
        });
    }

    Ok(metrics::summarize(
        trades,
        &equity_curve,
        settings.initial_equity,
        equity,
    ))
}

/// Fixed-fractional sizing with exchange fidelity. Returns `None` when the
/// exchange would reject the order (notional floor, margin exhausted).
fn size_entry(
    lane: &SymbolLane,
    direction: Direction,
    bar: usize,
    equity: f64,
    margin_in_use: f64,
    params: &TradeParams,
    settings: &SimSettings,
) -> Option<OpenPosition> {
    let risk_amount = equity * settings.risk_per_trade_pct;
    let mut notional = risk_amount / params.sl_pct;
    let effective_leverage = params.leverage.min(lane.coin.max_leverage);
    let mut margin = notional / effective_leverage;

    // Diversification cap on per-trade margin
    let max_margin = equity / f64::from(settings.max_concurrent_positions);
    if margin > max_margin {
        margin = max_margin;
        notional = margin * effective_leverage;
    }

    let floor = settings.min_notional.max(lane.coin.min_notional);
    if notional < floor {
        return None;
    }
    if margin > equity - margin_in_use {
        return None;
    }

    let entry_fill = adverse_fill(lane.series.open[bar], direction, settings.slippage_pct, true);
    Some(OpenPosition {
        direction,
        entry_index: bar,
        entry_ts: lane.series.ts[bar],
        entry_fill,
        notional,
        margin,
    })
}

/// Slippage-adjusted fill. Entries pay up (long buys higher, short sells
/// lower); exits give back the same way.
fn adverse_fill(price: f64, direction: Direction, slippage_pct: f64, entry: bool) -> f64 {
    let sign = if entry {
        direction.multiplier()
    } else {
        -direction.multiplier()
    };
    price * (1.0 + sign * slippage_pct)
}

#[allow(clippy::too_many_arguments)]
fn settle(
    equity: &mut f64,
    margin_in_use: &mut f64,
    trades: &mut Vec<Trade>,
    lane: &SymbolLane,
    position: OpenPosition,
    exit_ts: i64,
    exit_fill: f64,
    round_trip_fees: f64,
    exit_reason: ExitReason,
) {
    let gross = position.direction.multiplier() * (exit_fill - position.entry_fill)
        / position.entry_fill;
    let pnl_fraction = gross - round_trip_fees;
    *equity += pnl_fraction * position.notional;
    *margin_in_use -= position.margin;

    trades.push(Trade {
        entry_ts: position.entry_ts,
        exit_ts,
        symbol: lane.series.symbol.clone(),
        direction: position.direction,
        entry_price: position.entry_fill,
        exit_price: exit_fill,
        notional: position.notional,
        pnl_fraction,
        exit_reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::series::Timeframe;

    const FEE: f64 = 0.00045;
    const SLIP: f64 = 0.0005;

    fn settings(min_bars: usize) -> SimSettings {
        SimSettings {
            initial_equity: 10_000.0,
            risk_per_trade_pct: 0.02,
            max_concurrent_positions: 10,
            fee_rate: FEE,
            slippage_pct: SLIP,
            min_notional: 10.0,
            min_bars,
        }
    }

    fn coin() -> Coin {
        Coin {
            symbol: "BTCUSDT".to_string(),
            max_leverage: 50.0,
            min_notional: 10.0,
            tradable: true,
        }
    }

    fn series_from_closes(closes: &[f64]) -> OhlcvSeries {
        let step = Timeframe::M15.bar_millis();
        let t0 = 1_700_000_000_000i64;
        let n = closes.len();
        // Each bar opens at the previous close; first bar opens at its close.
        let mut open = vec![closes[0]];
        open.extend_from_slice(&closes[..n - 1]);
        OhlcvSeries {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::M15,
            ts: (0..n).map(|i| t0 + i as i64 * step).collect(),
            open,
            high: closes.iter().map(|c| c * 1.01).collect(),
            low: closes.iter().map(|c| c * 0.99).collect(),
            close: closes.to_vec(),
            volume: vec![100.0; n],
        }
    }

    fn hold(n: usize) -> Vec<Signal> {
        vec![Signal::Hold; n]
    }

    fn params(sl: f64, tp: f64, lev: f64, exit_bars: u32) -> TradeParams {
        TradeParams {
            sl_pct: sl,
            tp_pct: tp,
            leverage: lev,
            exit_bars,
        }
    }

    #[test]
    fn no_signals_yields_zero_trades() {
        let s = series_from_closes(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        let signals = hold(5);
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        let r = run_portfolio(&lanes, &params(0.02, 0.04, 3.0, 0), &settings(3)).unwrap();
        assert_eq!(r.total_trades, 0);
        assert!((r.total_return - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn insufficient_data_errors() {
        let s = series_from_closes(&[100.0, 101.0]);
        let signals = hold(2);
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        let err = run_portfolio(&lanes, &params(0.02, 0.0, 3.0, 5), &settings(100)).unwrap_err();
        assert!(matches!(
            err,
            KernelError::InsufficientData {
                required: 100,
                available: 2
            }
        ));
    }

    #[test]
    fn misaligned_signals_error() {
        let s = series_from_closes(&[100.0, 101.0, 102.0]);
        let signals = hold(2);
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        assert!(matches!(
            run_portfolio(&lanes, &params(0.02, 0.0, 3.0, 5), &settings(2)),
            Err(KernelError::MisalignedSeries)
        ));
    }

    #[test]
    fn zero_sl_rejected() {
        let s = series_from_closes(&[100.0, 101.0, 102.0]);
        let signals = hold(3);
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        assert!(matches!(
            run_portfolio(&lanes, &params(0.0, 0.04, 3.0, 5), &settings(2)),
            Err(KernelError::InvalidParams(_))
        ));
    }

    #[test]
    fn take_profit_long_pnl_matches_formula() {
        // Entry signal at bar 0 close → fill at bar 1 open (100).
        // Bar 2 close 104.2 crosses entry_fill * 1.04 → TP exit.
        let s = series_from_closes(&[100.0, 101.0, 104.2, 104.0]);
        let mut signals = hold(4);
        signals[0] = Signal::OpenLong;
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        let st = settings(3);
        let p = params(0.02, 0.04, 3.0, 0);
        let r = run_portfolio(&lanes, &p, &st).unwrap();

        assert_eq!(r.total_trades, 1);
        let t = &r.trades[0];
        assert_eq!(t.exit_reason, ExitReason::TakeProfit);
        assert_eq!(t.direction, Direction::Long);

        let entry_fill = 100.0 * (1.0 + SLIP);
        let exit_fill = 104.2 * (1.0 - SLIP);
        let expected = (exit_fill - entry_fill) / entry_fill - 2.0 * FEE;
        assert!(
            (t.pnl_fraction - expected).abs() < 1e-12,
            "pnl {} vs expected {}",
            t.pnl_fraction,
            expected
        );

        // margin cap: equity/10 = 1000, notional = 1000 * 3 = 3000
        assert!((t.notional - 3_000.0).abs() < 1e-9);
        let expected_equity_gain = expected * 3_000.0;
        assert!((r.total_return - expected_equity_gain / 10_000.0).abs() < 1e-12);
    }

    #[test]
    fn stop_loss_short() {
        // Short entry at bar 1 open (100); bar 2 close 102.5 crosses
        // entry_fill * 1.02 → SL.
        let s = series_from_closes(&[100.0, 101.0, 102.5, 102.0]);
        let mut signals = hold(4);
        signals[0] = Signal::OpenShort;
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        let r = run_portfolio(&lanes, &params(0.02, 0.10, 3.0, 0), &settings(3)).unwrap();
        assert_eq!(r.total_trades, 1);
        assert_eq!(r.trades[0].exit_reason, ExitReason::StopLoss);
        assert!(r.trades[0].pnl_fraction < 0.0);
        assert!(r.total_return < 0.0);
        assert!(r.sharpe <= 0.0);
    }

    #[test]
    fn stop_loss_takes_priority_over_other_exits() {
        let s = series_from_closes(&[100.0, 100.0, 90.0, 90.0]);
        let mut signals = hold(4);
        signals[0] = Signal::OpenLong;
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        // sl 2%: 90 <= 100.05*0.98 → SL fires even though time exit also due
        let r = run_portfolio(&lanes, &params(0.02, 0.04, 2.0, 1), &settings(3)).unwrap();
        assert_eq!(r.trades[0].exit_reason, ExitReason::StopLoss);
    }

    #[test]
    fn time_exit_after_exit_bars() {
        let s = series_from_closes(&[100.0, 100.2, 100.3, 100.1, 100.2, 100.3]);
        let mut signals = hold(6);
        signals[0] = Signal::OpenLong;
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        // Wide SL/TP so only the time exit can fire; entered at bar 1,
        // exit_bars = 2 → exit at bar 3 close.
        let r = run_portfolio(&lanes, &params(0.10, 0.0, 2.0, 2), &settings(3)).unwrap();
        assert_eq!(r.total_trades, 1);
        assert_eq!(r.trades[0].exit_reason, ExitReason::Time);
        assert_eq!(r.trades[0].exit_ts, s.ts[3]);
    }

    #[test]
    fn end_of_series_closes_open_position() {
        let s = series_from_closes(&[100.0, 100.5, 100.8, 101.0]);
        let mut signals = hold(4);
        signals[0] = Signal::OpenLong;
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        let r = run_portfolio(&lanes, &params(0.10, 0.0, 2.0, 0), &settings(3)).unwrap();
        assert_eq!(r.total_trades, 1);
        assert_eq!(r.trades[0].exit_reason, ExitReason::EndOfSeries);
    }

    #[test]
    fn close_signal_exits_at_next_open() {
        let s = series_from_closes(&[100.0, 100.5, 101.0, 101.5, 102.0]);
        let mut signals = hold(5);
        signals[0] = Signal::OpenLong;
        signals[2] = Signal::Close;
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        let r = run_portfolio(&lanes, &params(0.10, 0.0, 2.0, 0), &settings(3)).unwrap();
        assert_eq!(r.total_trades, 1);
        // Close signal at bar 2 close → filled at bar 3 open (= close[2])
        assert_eq!(r.trades[0].exit_ts, s.ts[3]);
        assert_eq!(r.trades[0].exit_reason, ExitReason::Time);
        let expected_exit = 101.0 * (1.0 - SLIP);
        assert!((r.trades[0].exit_price - expected_exit).abs() < 1e-12);
    }

    #[test]
    fn min_notional_floor_rejects_dust_orders() {
        let s = series_from_closes(&[100.0, 100.5, 101.0, 101.5]);
        let mut signals = hold(4);
        signals[0] = Signal::OpenLong;
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        let mut st = settings(3);
        st.initial_equity = 20.0; // risk 0.40 / sl 0.05 → notional 8 < 10
        let r = run_portfolio(&lanes, &params(0.05, 0.0, 2.0, 2), &st).unwrap();
        assert_eq!(r.total_trades, 0);
    }

    #[test]
    fn margin_never_exceeds_equity() {
        // Many lanes all firing at once; the margin gate must keep
        // sum(margin) within equity.
        let closes = [100.0, 100.2, 100.4, 100.1, 100.3, 100.5, 100.2, 100.4];
        let series: Vec<OhlcvSeries> = (0..12)
            .map(|k| {
                let mut s = series_from_closes(&closes);
                s.symbol = format!("COIN{k}USDT");
                s
            })
            .collect();
        let mut signals = hold(8);
        for sig in signals.iter_mut().take(6) {
            *sig = Signal::OpenLong;
        }
        let coins: Vec<Coin> = (0..12)
            .map(|k| Coin {
                symbol: format!("COIN{k}USDT"),
                max_leverage: 50.0,
                min_notional: 10.0,
                tradable: true,
            })
            .collect();
        let lanes: Vec<SymbolLane> = series
            .iter()
            .zip(coins.iter())
            .map(|(s, c)| SymbolLane {
                series: s,
                signals: &signals,
                coin: c,
            })
            .collect();

        let mut st = settings(3);
        st.max_concurrent_positions = 4;
        let r = run_portfolio(&lanes, &params(0.01, 0.0, 40.0, 2), &st).unwrap();
        // At most 4 concurrent positions ever open → at most 4 trades per
        // entry wave; the simulation must simply not blow up the margin
        // invariant, which the sizing gate enforces by construction.
        assert!(r.total_trades > 0);
        for t in &r.trades {
            assert!(t.notional > 0.0);
        }
    }

    #[test]
    fn non_tradable_coin_is_skipped() {
        let s = series_from_closes(&[100.0, 100.5, 101.0, 101.5]);
        let mut signals = hold(4);
        signals[0] = Signal::OpenLong;
        let mut c = coin();
        c.tradable = false;
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        let r = run_portfolio(&lanes, &params(0.02, 0.0, 2.0, 2), &settings(3)).unwrap();
        assert_eq!(r.total_trades, 0);
    }

    #[test]
    fn kernel_is_deterministic() {
        let s = series_from_closes(&[100.0, 101.0, 99.5, 102.0, 98.0, 103.0, 100.5, 101.5]);
        let mut signals = hold(8);
        signals[0] = Signal::OpenLong;
        signals[3] = Signal::OpenShort;
        signals[5] = Signal::OpenLong;
        let c = coin();
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        let p = params(0.02, 0.03, 5.0, 3);
        let st = settings(3);
        let a = run_portfolio(&lanes, &p, &st).unwrap();
        let b = run_portfolio(&lanes, &p, &st).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn effective_leverage_respects_coin_cap() {
        let s = series_from_closes(&[100.0, 100.5, 101.0, 101.5]);
        let mut signals = hold(4);
        signals[0] = Signal::OpenLong;
        let mut c = coin();
        c.max_leverage = 2.0;
        let lanes = [SymbolLane {
            series: &s,
            signals: &signals,
            coin: &c,
        }];
        // lev 40 requested, coin caps at 2 → margin = notional/2; with the
        // diversification cap at 1000, notional = 2000.
        let r = run_portfolio(&lanes, &params(0.02, 0.0, 40.0, 2), &settings(3)).unwrap();
        assert_eq!(r.total_trades, 1);
        assert!((r.trades[0].notional - 2_000.0).abs() < 1e-9);
    }
}
