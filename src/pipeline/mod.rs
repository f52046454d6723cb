pub mod retest;
pub mod worker;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::engine::evaluator;
use crate::engine::kernel::SymbolLane;
use crate::engine::optimizer::{self, OptimizedCombo};
use crate::engine::score;
use crate::engine::shuffle::ShuffleTester;
use crate::engine::walk_forward;
use crate::error::{RejectReason, Stage};
use crate::market::cache::SeriesCache;
use crate::market::series::{OhlcvSeries, MS_PER_DAY};
use crate::market::{Coin, CoinRegistry, MarketData};
use crate::pool::{AdmitOutcome, PoolManager};
use crate::store::Store;
use crate::strategy::script::ScriptStrategy;
use crate::strategy::{Candidate, CandidateStatus, Signal, SourceClass};

/// One symbol's evaluation inputs, owned so kernel lanes can borrow them.
pub(crate) struct LaneData {
    pub series: OhlcvSeries,
    pub signals: Vec<Signal>,
    pub coin: Coin,
}

pub(crate) fn lanes(data: &[LaneData]) -> Vec<SymbolLane<'_>> {
    data.iter()
        .map(|d| SymbolLane {
            series: &d.series,
            signals: &d.signals,
            coin: &d.coin,
        })
        .collect()
}

/// The funnel: shared state for the worker pool, plus the stage sequence
/// each claimed candidate runs through.
pub struct Pipeline {
    pub config: Config,
    pub store: Arc<Store>,
    pub pool: PoolManager<Arc<Store>>,
    pub market: SeriesCache,
    pub registry: Box<dyn CoinRegistry>,
    pub shuffle: ShuffleTester,
    accepting: AtomicBool,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<Store>,
        market: Box<dyn MarketData>,
        registry: Box<dyn CoinRegistry>,
    ) -> Result<Self> {
        let pool = PoolManager::new(
            config.pool.max_size,
            config.pool.min_score,
            Arc::clone(&store),
        );
        pool.load(store.pool_entries()?);

        let shuffle = ShuffleTester::new(
            config.shuffle.iterations,
            config.shuffle.max_similarity,
            Arc::clone(&store) as Arc<dyn crate::engine::shuffle::VerdictCache>,
        );
        let market = SeriesCache::new(market, config.cache_ttl());

        Ok(Self {
            config,
            store,
            pool,
            market,
            registry,
            shuffle,
            accepting: AtomicBool::new(true),
        })
    }

    /// Backpressure hook: when intake is paused, workers do idle-time
    /// retests only.
    pub fn pause_intake(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn resume_intake(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Coins the candidate is evaluated on: pattern-derived candidates use
    /// their own high-edge list, everything else gets the top of the volume
    /// table.
    pub(crate) fn portfolio_symbols(&self, candidate: &Candidate) -> Vec<String> {
        let size = self.config.universe.portfolio_size;
        if candidate.source_class == SourceClass::PatternDerived {
            let preferred: Vec<String> = candidate
                .preferred_symbols(size)
                .into_iter()
                .filter(|s| self.registry.coin(s).is_some_and(|c| c.tradable))
                .collect();
            if !preferred.is_empty() {
                return preferred;
            }
        }
        self.registry.top_by_volume(size)
    }

    /// Load the full evaluation window for each portfolio symbol.
    pub(crate) fn load_portfolio(
        &self,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<Vec<(OhlcvSeries, Coin)>> {
        let total_days = self.config.is.window_days + self.config.oos.window_days;
        let end_ms = now.timestamp_millis();
        let start_ms = end_ms - i64::from(total_days) * MS_PER_DAY;

        let mut portfolio = Vec::new();
        for symbol in self.portfolio_symbols(candidate) {
            let Some(coin) = self.registry.coin(&symbol) else {
                tracing::warn!(%symbol, "symbol missing from coin registry, skipped");
                continue;
            };
            let series = self
                .market
                .get_series(&symbol, candidate.timeframe, start_ms, end_ms)
                .with_context(|| format!("market data unavailable for {symbol}"))?;
            portfolio.push((series, coin));
        }
        Ok(portfolio)
    }

    /// Drive one claimed candidate through the stage sequence
    /// C3 → C4 → C5 → (C6 → C7 → C8), recording every transition.
    pub fn process_candidate(&self, candidate: &Candidate, now: DateTime<Utc>) -> Result<()> {
        tracing::info!(candidate = %candidate.id, name = %candidate.name, "evaluating");

        let program = match ScriptStrategy::compile(&candidate.code_blob) {
            Ok(p) => p,
            Err(e) => {
                // Syntactic validation is upstream; a blob that fails to
                // compile here has no value
                tracing::warn!(candidate = %candidate.id, error = %e, "code blob failed to compile");
                self.store
                    .record_event(&candidate.id, Stage::Optimize, "error", None, now)?;
                self.store.delete_candidate(&candidate.id)?;
                return Ok(());
            }
        };

        let portfolio = self.load_portfolio(candidate, now)?;
        let mut is_data = Vec::with_capacity(portfolio.len());
        let mut oos_data = Vec::with_capacity(portfolio.len());
        let mut wfa_data = Vec::with_capacity(portfolio.len());
        for (series, coin) in &portfolio {
            let (is_series, oos_series) = series
                .split_is_oos(self.config.is.window_days, self.config.oos.window_days)
                .with_context(|| format!("IS/OOS split failed for {}", series.symbol))?;
            let is_signals = program.signals(&is_series)?;
            let oos_signals = program.signals(&oos_series)?;
            wfa_data.push((is_series.clone(), coin.clone()));
            is_data.push(LaneData {
                series: is_series,
                signals: is_signals,
                coin: coin.clone(),
            });
            oos_data.push(LaneData {
                series: oos_series,
                signals: oos_signals,
                coin: coin.clone(),
            });
        }

        // C3: parametric sweep on the in-sample portfolio
        let is_lanes = lanes(&is_data);
        let combo: OptimizedCombo = match optimizer::optimize(candidate, &is_lanes, &self.config) {
            Ok(combo) => combo,
            Err(reason) => return self.reject(candidate, Stage::Optimize, &reason, now),
        };
        self.store
            .record_event(&candidate.id, Stage::Optimize, "passed", None, now)?;

        // C4: IS/OOS with the winning parameters
        let oos_lanes = lanes(&oos_data);
        let outcome = match evaluator::evaluate(
            &is_lanes,
            &oos_lanes,
            &combo.params,
            candidate.timeframe,
            &self.config,
        ) {
            Ok(outcome) => outcome,
            Err(reason) => return self.reject(candidate, Stage::Evaluate, &reason, now),
        };
        self.store
            .record_event(&candidate.id, Stage::Evaluate, "passed", None, now)?;

        // C5: scalar score; the floor short-circuits the remaining tests
        let final_score = score::score(&outcome);
        if final_score < self.config.pool.min_score {
            self.store.record_event(
                &candidate.id,
                Stage::Score,
                "rejected",
                Some(&RejectReason::ScoreBelowThreshold.code()),
                now,
            )?;
            self.store.update_after_eval(
                &candidate.id,
                &combo.params,
                final_score,
                now,
                CandidateStatus::Retired,
            )?;
            return Ok(());
        }
        self.store
            .record_event(&candidate.id, Stage::Score, "passed", None, now)?;

        // C6: empirical lookahead check, memoized on the code fingerprint
        let shuffle_end = now.timestamp_millis();
        let shuffle_start =
            shuffle_end - i64::from(self.config.shuffle.data_days) * MS_PER_DAY;
        let reference = self.market.get_series(
            &self.config.shuffle.symbol,
            candidate.timeframe,
            shuffle_start,
            shuffle_end,
        )?;
        let verdict = self
            .shuffle
            .run(&candidate.code_fingerprint, &program, &reference)?;
        if !verdict.passed {
            self.store.record_event(
                &candidate.id,
                Stage::Shuffle,
                "rejected",
                Some(&RejectReason::ShuffleFailed.code()),
                now,
            )?;
            self.store.update_after_eval(
                &candidate.id,
                &combo.params,
                final_score,
                now,
                CandidateStatus::Retired,
            )?;
            return Ok(());
        }
        self.store
            .record_event(&candidate.id, Stage::Shuffle, "passed", None, now)?;

        // C7: expanding-window stability with fixed parameters
        let report = walk_forward::validate(&program, &wfa_data, &combo.params, &self.config)?;
        if !report.pass() {
            let reason = RejectReason::WfaFailed {
                passed: report.passed,
                required: report.required,
            };
            self.store.record_event(
                &candidate.id,
                Stage::WalkForward,
                "rejected",
                Some(&reason.code()),
                now,
            )?;
            self.store.update_after_eval(
                &candidate.id,
                &combo.params,
                final_score,
                now,
                CandidateStatus::Retired,
            )?;
            return Ok(());
        }
        self.store
            .record_event(&candidate.id, Stage::WalkForward, "passed", None, now)?;

        // C8: competitive admission
        match self.pool.try_admit(&candidate.id, final_score, now)? {
            AdmitOutcome::Admitted => {
                self.store.update_after_eval(
                    &candidate.id,
                    &combo.params,
                    final_score,
                    now,
                    CandidateStatus::Active,
                )?;
                self.store
                    .record_event(&candidate.id, Stage::PoolAdmission, "admitted", None, now)?;
                tracing::info!(candidate = %candidate.id, score = final_score, "admitted to pool");
            }
            AdmitOutcome::AdmittedWithEviction { evicted } => {
                self.store.update_after_eval(
                    &candidate.id,
                    &combo.params,
                    final_score,
                    now,
                    CandidateStatus::Active,
                )?;
                self.store
                    .record_event(&candidate.id, Stage::PoolAdmission, "admitted", None, now)?;
                self.store.set_status(&evicted, CandidateStatus::Retired)?;
                self.store
                    .record_event(&evicted, Stage::PoolAdmission, "evicted", None, now)?;
                tracing::info!(
                    candidate = %candidate.id,
                    score = final_score,
                    %evicted,
                    "admitted to pool with eviction"
                );
            }
            AdmitOutcome::RejectedBelowWorst | AdmitOutcome::RejectedBelowFloor => {
                self.store.record_event(
                    &candidate.id,
                    Stage::PoolAdmission,
                    "rejected",
                    Some(&RejectReason::PoolRejected.code()),
                    now,
                )?;
                self.store.update_after_eval(
                    &candidate.id,
                    &combo.params,
                    final_score,
                    now,
                    CandidateStatus::Retired,
                )?;
            }
        }
        Ok(())
    }

    /// Record a stage rejection and apply the delete-vs-retire policy.
    fn reject(
        &self,
        candidate: &Candidate,
        stage: Stage,
        reason: &RejectReason,
        now: DateTime<Utc>,
    ) -> Result<()> {
        tracing::info!(candidate = %candidate.id, stage = stage.as_str(), reason = %reason, "rejected");
        self.store
            .record_event(&candidate.id, stage, "rejected", Some(&reason.code()), now)?;
        if reason.deletes_candidate() {
            self.store.delete_candidate(&candidate.id)?;
        } else {
            self.store.set_status(&candidate.id, CandidateStatus::Retired)?;
        }
        Ok(())
    }
}
