use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use super::{lanes, LaneData, Pipeline};
use crate::engine::{evaluator, score};
use crate::error::{RejectReason, Stage};
use crate::pool::RevalidateOutcome;
use crate::strategy::script::ScriptStrategy;
use crate::strategy::CandidateStatus;

/// Idle-time pool freshness: re-evaluate the stalest member whose last
/// evaluation is older than the retest interval.
///
/// A retest is cheaper than initial evaluation by design: only the
/// candidate's own timeframe, no re-optimization, and no shuffle or
/// walk-forward re-runs (one-shot properties of logic + parameters).
/// Returns true when a retest actually ran.
pub fn run_idle_retest(pipeline: &Pipeline, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let cutoff = now - Duration::days(i64::from(pipeline.config.retest.interval_days));
    let Some(entry) = pipeline.pool.oldest_stale(cutoff) else {
        return Ok(false);
    };
    // The claim table guards retests too, so two idle workers cannot
    // re-evaluate the same member
    if !pipeline.store.try_claim(&entry.candidate_id, worker_id, now)? {
        return Ok(false);
    }
    let outcome = retest_member(pipeline, &entry.candidate_id, now);
    pipeline.store.release_claim(&entry.candidate_id)?;
    outcome?;
    Ok(true)
}

fn retest_member(pipeline: &Pipeline, candidate_id: &str, now: DateTime<Utc>) -> Result<()> {
    let Some(candidate) = pipeline.store.get_candidate(candidate_id)? else {
        // Row vanished under us; drop the pool entry to match
        pipeline.pool.revalidate(candidate_id, 0.0, now)?;
        return Ok(());
    };
    let Some(params) = candidate.parameters else {
        tracing::warn!(candidate = %candidate_id, "pool member has no parameters, retiring");
        pipeline.pool.revalidate(candidate_id, 0.0, now)?;
        pipeline
            .store
            .set_status(candidate_id, CandidateStatus::Retired)?;
        return Ok(());
    };

    tracing::info!(candidate = %candidate_id, "retesting stale pool member");
    let program = ScriptStrategy::compile(&candidate.code_blob)?;

    let portfolio = pipeline.load_portfolio(&candidate, now)?;
    let mut is_data = Vec::with_capacity(portfolio.len());
    let mut oos_data = Vec::with_capacity(portfolio.len());
    for (series, coin) in &portfolio {
        let (is_series, oos_series) = series.split_is_oos(
            pipeline.config.is.window_days,
            pipeline.config.oos.window_days,
        )?;
        let is_signals = program.signals(&is_series)?;
        let oos_signals = program.signals(&oos_series)?;
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

    let evaluated = evaluator::evaluate(
        &lanes(&is_data),
        &lanes(&oos_data),
        &params,
        candidate.timeframe,
        &pipeline.config,
    );

    match evaluated {
        Ok(outcome) => {
            let new_score = score::score(&outcome);
            match pipeline.pool.revalidate(candidate_id, new_score, now)? {
                RevalidateOutcome::StillActive => {
                    pipeline.store.update_after_eval(
                        candidate_id,
                        &params,
                        new_score,
                        now,
                        CandidateStatus::Active,
                    )?;
                    pipeline
                        .store
                        .record_event(candidate_id, Stage::Retest, "passed", None, now)?;
                }
                RevalidateOutcome::Retired => {
                    let reason = if new_score < pipeline.config.pool.min_score {
                        RejectReason::ScoreBelowThreshold
                    } else {
                        RejectReason::PoolRejected
                    };
                    pipeline.store.update_after_eval(
                        candidate_id,
                        &params,
                        new_score,
                        now,
                        CandidateStatus::Retired,
                    )?;
                    pipeline.store.record_event(
                        candidate_id,
                        Stage::Retest,
                        "rejected",
                        Some(&reason.code()),
                        now,
                    )?;
                    tracing::info!(candidate = %candidate_id, score = new_score, "retest demoted");
                }
            }
        }
        Err(reason) => {
            // The member no longer clears the funnel's own thresholds;
            // retests retire rather than delete — the record stays
            pipeline.pool.revalidate(candidate_id, 0.0, now)?;
            pipeline
                .store
                .set_status(candidate_id, CandidateStatus::Retired)?;
            pipeline.store.record_event(
                candidate_id,
                Stage::Retest,
                "rejected",
                Some(&reason.code()),
                now,
            )?;
            tracing::info!(candidate = %candidate_id, reason = %reason, "retest retired member");
        }
    }
    Ok(())
}
