use anyhow::Result;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Mutex;

/// A pool membership row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntry {
    pub candidate_id: String,
    pub score: f64,
    pub last_evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    AdmittedWithEviction { evicted: String },
    RejectedBelowFloor,
    RejectedBelowWorst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevalidateOutcome {
    StillActive,
    Retired,
}

/// Write-through persistence for pool membership. Called inside the pool's
/// critical section so the durable view can never disagree with memory.
pub trait PoolPersistence: Send + Sync {
    fn upsert(&self, entry: &PoolEntry) -> Result<()>;
    fn remove(&self, candidate_id: &str) -> Result<()>;
}

impl<P: PoolPersistence + ?Sized> PoolPersistence for std::sync::Arc<P> {
    fn upsert(&self, entry: &PoolEntry) -> Result<()> {
        (**self).upsert(entry)
    }
    fn remove(&self, candidate_id: &str) -> Result<()> {
        (**self).remove(candidate_id)
    }
}

/// No-op persistence for tests and tooling.
pub struct NoPersistence;

impl PoolPersistence for NoPersistence {
    fn upsert(&self, _entry: &PoolEntry) -> Result<()> {
        Ok(())
    }
    fn remove(&self, _candidate_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Ascending order puts the eviction victim first: lowest score, then
/// earliest `last_evaluated_at` (stalest goes first on ties), then id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PoolKey {
    score: OrderedFloat<f64>,
    evaluated_at_ms: i64,
    id: String,
}

struct PoolState {
    ranked: BTreeSet<PoolKey>,
    by_id: FxHashMap<String, PoolKey>,
}

/// Bounded ranked multiset of (candidate, score) — the leaderboard the
/// rotator deploys from.
///
/// One mutex serializes every mutation; check-then-insert is a single
/// critical section, so admissions are linearizable and the two pool
/// invariants (`score ≥ min_score` for every member, `size ≤ max_size`)
/// hold at every observable moment.
pub struct PoolManager<P: PoolPersistence> {
    max_size: usize,
    min_score: f64,
    state: Mutex<PoolState>,
    persistence: P,
}

impl<P: PoolPersistence> PoolManager<P> {
    pub fn new(max_size: usize, min_score: f64, persistence: P) -> Self {
        Self {
            max_size,
            min_score,
            state: Mutex::new(PoolState {
                ranked: BTreeSet::new(),
                by_id: FxHashMap::default(),
            }),
            persistence,
        }
    }

    /// Rebuild in-memory state from persisted entries at startup.
    pub fn load(&self, entries: Vec<PoolEntry>) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        for entry in entries {
            let key = PoolKey {
                score: OrderedFloat(entry.score),
                evaluated_at_ms: entry.last_evaluated_at.timestamp_millis(),
                id: entry.candidate_id.clone(),
            };
            state.by_id.insert(entry.candidate_id, key.clone());
            state.ranked.insert(key);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("pool mutex poisoned").ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomic competitive admission.
    pub fn try_admit(
        &self,
        candidate_id: &str,
        score: f64,
        evaluated_at: DateTime<Utc>,
    ) -> Result<AdmitOutcome> {
        if score < self.min_score {
            return Ok(AdmitOutcome::RejectedBelowFloor);
        }

        let mut state = self.state.lock().expect("pool mutex poisoned");

        // Re-admission replaces the previous entry
        if let Some(old) = state.by_id.remove(candidate_id) {
            state.ranked.remove(&old);
        }

        let key = PoolKey {
            score: OrderedFloat(score),
            evaluated_at_ms: evaluated_at.timestamp_millis(),
            id: candidate_id.to_string(),
        };
        let entry = PoolEntry {
            candidate_id: candidate_id.to_string(),
            score,
            last_evaluated_at: evaluated_at,
        };

        if state.ranked.len() < self.max_size {
            state.by_id.insert(candidate_id.to_string(), key.clone());
            state.ranked.insert(key);
            self.persistence.upsert(&entry)?;
            return Ok(AdmitOutcome::Admitted);
        }

        let worst = state
            .ranked
            .first()
            .cloned()
            .expect("full pool cannot be empty");
        if score > worst.score.into_inner() {
            state.ranked.remove(&worst);
            state.by_id.remove(&worst.id);
            state.by_id.insert(candidate_id.to_string(), key.clone());
            state.ranked.insert(key);
            self.persistence.remove(&worst.id)?;
            self.persistence.upsert(&entry)?;
            Ok(AdmitOutcome::AdmittedWithEviction { evicted: worst.id })
        } else {
            Ok(AdmitOutcome::RejectedBelowWorst)
        }
    }

    /// Atomic post-retest refresh: drop the member if it no longer earns its
    /// slot, otherwise record the new score and evaluation time.
    pub fn revalidate(
        &self,
        candidate_id: &str,
        new_score: f64,
        evaluated_at: DateTime<Utc>,
    ) -> Result<RevalidateOutcome> {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        let Some(old) = state.by_id.remove(candidate_id) else {
            return Ok(RevalidateOutcome::Retired);
        };
        state.ranked.remove(&old);
        let was_full = state.ranked.len() + 1 >= self.max_size;

        let drop_below_floor = new_score < self.min_score;
        let drop_below_worst = was_full
            && state
                .ranked
                .first()
                .is_some_and(|worst| new_score <= worst.score.into_inner());

        if drop_below_floor || drop_below_worst {
            self.persistence.remove(candidate_id)?;
            return Ok(RevalidateOutcome::Retired);
        }

        let key = PoolKey {
            score: OrderedFloat(new_score),
            evaluated_at_ms: evaluated_at.timestamp_millis(),
            id: candidate_id.to_string(),
        };
        state.by_id.insert(candidate_id.to_string(), key.clone());
        state.ranked.insert(key);
        self.persistence.upsert(&PoolEntry {
            candidate_id: candidate_id.to_string(),
            score: new_score,
            last_evaluated_at: evaluated_at,
        })?;
        Ok(RevalidateOutcome::StillActive)
    }

    /// Score-descending snapshot for the rotator.
    pub fn list_active(&self) -> Vec<PoolEntry> {
        let state = self.state.lock().expect("pool mutex poisoned");
        state
            .ranked
            .iter()
            .rev()
            .map(|key| PoolEntry {
                candidate_id: key.id.clone(),
                score: key.score.into_inner(),
                last_evaluated_at: DateTime::<Utc>::from_timestamp_millis(key.evaluated_at_ms)
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// The member with the oldest `last_evaluated_at` strictly before
    /// `cutoff`, if any — the retest scheduler's FIFO pick.
    pub fn oldest_stale(&self, cutoff: DateTime<Utc>) -> Option<PoolEntry> {
        let state = self.state.lock().expect("pool mutex poisoned");
        state
            .ranked
            .iter()
            .filter(|key| key.evaluated_at_ms < cutoff.timestamp_millis())
            .min_by_key(|key| (key.evaluated_at_ms, key.id.clone()))
            .map(|key| PoolEntry {
                candidate_id: key.id.clone(),
                score: key.score.into_inner(),
                last_evaluated_at: DateTime::<Utc>::from_timestamp_millis(key.evaluated_at_ms)
                    .unwrap_or_default(),
            })
    }

    /// Current worst (score, id), for observability.
    pub fn worst(&self) -> Option<(f64, String)> {
        let state = self.state.lock().expect("pool mutex poisoned");
        state
            .ranked
            .first()
            .map(|key| (key.score.into_inner(), key.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset_secs, 0).unwrap()
    }

    fn pool(max_size: usize) -> PoolManager<NoPersistence> {
        PoolManager::new(max_size, 40.0, NoPersistence)
    }

    #[test]
    fn below_floor_rejected() {
        let p = pool(3);
        assert_eq!(
            p.try_admit("a", 39.9, ts(0)).unwrap(),
            AdmitOutcome::RejectedBelowFloor
        );
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn admit_when_not_full() {
        let p = pool(3);
        assert_eq!(p.try_admit("a", 55.0, ts(0)).unwrap(), AdmitOutcome::Admitted);
        assert_eq!(p.try_admit("b", 45.0, ts(1)).unwrap(), AdmitOutcome::Admitted);
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn one_slot_left_never_evicts() {
        let p = pool(3);
        p.try_admit("a", 55.0, ts(0)).unwrap();
        p.try_admit("b", 45.0, ts(1)).unwrap();
        // |P| = max_size − 1: plain admission regardless of relative score
        assert_eq!(
            p.try_admit("c", 41.0, ts(2)).unwrap(),
            AdmitOutcome::Admitted
        );
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn full_pool_evicts_strictly_worse() {
        let p = pool(2);
        p.try_admit("a", 42.3, ts(0)).unwrap();
        p.try_admit("b", 55.0, ts(1)).unwrap();
        let outcome = p.try_admit("c", 48.7, ts(2)).unwrap();
        assert_eq!(
            outcome,
            AdmitOutcome::AdmittedWithEviction {
                evicted: "a".to_string()
            }
        );
        assert_eq!(p.len(), 2);
        assert_eq!(p.worst().unwrap().1, "c");
    }

    #[test]
    fn equal_to_worst_rejected_when_full() {
        let p = pool(2);
        p.try_admit("a", 42.3, ts(0)).unwrap();
        p.try_admit("b", 55.0, ts(1)).unwrap();
        // Strict > required for eviction
        assert_eq!(
            p.try_admit("c", 42.3, ts(2)).unwrap(),
            AdmitOutcome::RejectedBelowWorst
        );
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn below_worst_rejected_when_full() {
        let p = pool(2);
        p.try_admit("a", 42.3, ts(0)).unwrap();
        p.try_admit("b", 55.0, ts(1)).unwrap();
        assert_eq!(
            p.try_admit("c", 41.0, ts(2)).unwrap(),
            AdmitOutcome::RejectedBelowWorst
        );
    }

    #[test]
    fn tie_break_evicts_stalest() {
        let p = pool(2);
        p.try_admit("old", 42.0, ts(0)).unwrap();
        p.try_admit("new", 42.0, ts(100)).unwrap();
        let outcome = p.try_admit("c", 50.0, ts(200)).unwrap();
        assert_eq!(
            outcome,
            AdmitOutcome::AdmittedWithEviction {
                evicted: "old".to_string()
            }
        );
    }

    #[test]
    fn list_active_is_score_descending() {
        let p = pool(5);
        p.try_admit("a", 44.0, ts(0)).unwrap();
        p.try_admit("b", 61.0, ts(1)).unwrap();
        p.try_admit("c", 52.0, ts(2)).unwrap();
        let ids: Vec<String> = p.list_active().into_iter().map(|e| e.candidate_id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn revalidate_below_floor_retires() {
        let p = pool(3);
        p.try_admit("a", 55.0, ts(0)).unwrap();
        assert_eq!(
            p.revalidate("a", 31.0, ts(10)).unwrap(),
            RevalidateOutcome::Retired
        );
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn revalidate_below_worst_when_full_retires() {
        let p = pool(2);
        p.try_admit("a", 50.0, ts(0)).unwrap();
        p.try_admit("b", 60.0, ts(1)).unwrap();
        // Pool full; a's refreshed score ties the remaining worst (b=60 is
        // the only other member) — strictly-not-greater drops it
        assert_eq!(
            p.revalidate("a", 60.0, ts(10)).unwrap(),
            RevalidateOutcome::Retired
        );
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn revalidate_refreshes_score_and_time() {
        let p = pool(3);
        p.try_admit("a", 55.0, ts(0)).unwrap();
        p.try_admit("b", 45.0, ts(1)).unwrap();
        assert_eq!(
            p.revalidate("b", 58.0, ts(10)).unwrap(),
            RevalidateOutcome::StillActive
        );
        let entries = p.list_active();
        assert_eq!(entries[0].candidate_id, "b");
        assert!((entries[0].score - 58.0).abs() < f64::EPSILON);
        assert_eq!(entries[0].last_evaluated_at, ts(10));
    }

    #[test]
    fn revalidate_unknown_member_is_retired() {
        let p = pool(3);
        assert_eq!(
            p.revalidate("ghost", 90.0, ts(0)).unwrap(),
            RevalidateOutcome::Retired
        );
    }

    #[test]
    fn oldest_stale_picks_fifo() {
        let p = pool(5);
        p.try_admit("a", 50.0, ts(100)).unwrap();
        p.try_admit("b", 60.0, ts(50)).unwrap();
        p.try_admit("c", 70.0, ts(200)).unwrap();
        let stale = p.oldest_stale(ts(150)).unwrap();
        assert_eq!(stale.candidate_id, "b");
        // Nothing older than the cutoff → none
        assert!(p.oldest_stale(ts(40)).is_none());
    }

    #[test]
    fn cardinality_never_exceeds_max_under_concurrency() {
        let p = Arc::new(pool(10));
        let mut handles = Vec::new();
        for worker in 0..4 {
            let p = Arc::clone(&p);
            handles.push(std::thread::spawn(move || {
                for k in 0..50 {
                    let id = format!("w{worker}-{k}");
                    let score = 40.0 + f64::from(k % 50);
                    p.try_admit(&id, score, ts(i64::from(k))).unwrap();
                    assert!(p.len() <= 10);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(p.len() <= 10);
        // Floor invariant across everything that remains
        for entry in p.list_active() {
            assert!(entry.score >= 40.0);
        }
    }
}
