use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::retest;
use super::Pipeline;

/// How long an idle worker sleeps before re-polling for work.
const IDLE_POLL: Duration = Duration::from_millis(500);

/// Janitor sweep cadence for stale claims.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// First pause after a structural failure (market data, store); doubles per
/// consecutive failure up to [`MAX_ERROR_BACKOFF`].
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(300);

/// Start the worker pool and the claim janitor. Threads run until
/// `shutdown` flips; join the returned handles to drain.
pub fn spawn(pipeline: Arc<Pipeline>, shutdown: Arc<AtomicBool>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for n in 0..pipeline.config.workers.count {
        let pipeline = Arc::clone(&pipeline);
        let shutdown = Arc::clone(&shutdown);
        let worker_id = format!("worker-{n}");
        handles.push(
            std::thread::Builder::new()
                .name(worker_id.clone())
                .spawn(move || worker_loop(&pipeline, &worker_id, &shutdown))
                .expect("failed to spawn worker thread"),
        );
    }

    let janitor_pipeline = Arc::clone(&pipeline);
    let janitor_shutdown = Arc::clone(&shutdown);
    handles.push(
        std::thread::Builder::new()
            .name("janitor".to_string())
            .spawn(move || janitor_loop(&janitor_pipeline, &janitor_shutdown))
            .expect("failed to spawn janitor thread"),
    );

    handles
}

fn worker_loop(pipeline: &Pipeline, worker_id: &str, shutdown: &AtomicBool) {
    tracing::info!(worker = %worker_id, "worker started");
    let mut backoff = ERROR_BACKOFF;
    while !shutdown.load(Ordering::SeqCst) {
        match work_once(pipeline, worker_id) {
            Ok(true) => backoff = ERROR_BACKOFF,
            Ok(false) => {
                backoff = ERROR_BACKOFF;
                std::thread::sleep(IDLE_POLL);
            }
            Err(e) => {
                tracing::error!(worker = %worker_id, error = %e, "worker iteration failed");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_ERROR_BACKOFF);
            }
        }
    }
    tracing::info!(worker = %worker_id, "worker stopped");
}

/// One scheduling decision: fresh `validated` candidates always preempt
/// retests; retests are strictly idle-time work.
fn work_once(pipeline: &Pipeline, worker_id: &str) -> anyhow::Result<bool> {
    let now = Utc::now();

    if pipeline.is_accepting() {
        if let Some(candidate) = pipeline.store.claim_next_validated(worker_id, now)? {
            let result = pipeline.process_candidate(&candidate, now);
            // The claim is released whether the stage sequence committed or
            // aborted; an aborted candidate stays `validated` and is
            // eligible for re-claim
            pipeline.store.release_claim(&candidate.id)?;
            result?;
            return Ok(true);
        }
    }

    retest::run_idle_retest(pipeline, worker_id, now)
}

fn janitor_loop(pipeline: &Pipeline, shutdown: &AtomicBool) {
    let stale_after = pipeline.config.stale_timeout();
    while !shutdown.load(Ordering::SeqCst) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::minutes(30));
        match pipeline.store.release_stale_claims(cutoff) {
            Ok(released) if !released.is_empty() => {
                tracing::warn!(count = released.len(), ids = ?released, "released stale claims");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "janitor sweep failed"),
        }
        // Sleep in short slices so shutdown stays responsive
        let mut remaining = JANITOR_INTERVAL;
        while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
            let slice = remaining.min(Duration::from_millis(250));
            std::thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
    }
}
