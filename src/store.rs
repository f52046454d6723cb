use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::engine::shuffle::{ShuffleVerdict, VerdictCache};
use crate::error::Stage;
use crate::market::series::Timeframe;
use crate::pool::{PoolEntry, PoolPersistence};
use crate::strategy::{Candidate, CandidateStatus, PatternMeta, SourceClass, TradeParams};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// One row of the append-only evaluation audit log.
#[derive(Debug, Clone)]
pub struct EvaluationEvent {
    pub candidate_id: String,
    pub stage: String,
    pub outcome: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Single-file persistent state: candidates, pool membership, the shuffle
/// verdict cache, worker claims and the evaluation event log.
///
/// One connection behind a mutex serializes writes; candidate rows follow a
/// single-writer convention enforced by the claim table.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Store> {
        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        embedded::migrations::runner()
            .run(&mut conn)
            .context("store migrations failed")?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Store> {
        let mut conn = Connection::open_in_memory()?;
        embedded::migrations::runner()
            .run(&mut conn)
            .context("store migrations failed")?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    // --- candidates ---

    pub fn insert_candidate(&self, candidate: &Candidate) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO candidates (id, name, code_blob, code_fingerprint, timeframe, \
             source_class, pattern_meta, status, parameters, score_backtest, created_at, \
             last_evaluated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                candidate.id,
                candidate.name,
                candidate.code_blob,
                candidate.code_fingerprint,
                candidate.timeframe.as_str(),
                candidate.source_class.as_str(),
                candidate
                    .pattern
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                candidate.status.as_str(),
                candidate
                    .parameters
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                candidate.score_backtest,
                candidate.created_at.timestamp_millis(),
                candidate.last_evaluated_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    pub fn get_candidate(&self, id: &str) -> Result<Option<Candidate>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let row = conn
            .query_row(
                "SELECT id, name, code_blob, code_fingerprint, timeframe, source_class, \
                 pattern_meta, status, parameters, score_backtest, created_at, \
                 last_evaluated_at FROM candidates WHERE id = ?1",
                params![id],
                candidate_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Atomically claim the oldest unclaimed `validated` candidate for a
    /// worker. The SELECT and the claim INSERT are one transaction, so two
    /// workers can never claim the same row.
    pub fn claim_next_validated(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Candidate>> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let candidate = tx
            .query_row(
                "SELECT id, name, code_blob, code_fingerprint, timeframe, source_class, \
                 pattern_meta, status, parameters, score_backtest, created_at, \
                 last_evaluated_at FROM candidates \
                 WHERE status = 'validated' \
                 AND id NOT IN (SELECT candidate_id FROM claims) \
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                [],
                candidate_from_row,
            )
            .optional()?;
        if let Some(candidate) = &candidate {
            tx.execute(
                "INSERT INTO claims (candidate_id, worker_id, claimed_at) VALUES (?1, ?2, ?3)",
                params![candidate.id, worker_id, now.timestamp_millis()],
            )?;
        }
        tx.commit()?;
        Ok(candidate)
    }

    /// Claim a specific candidate (used by retests). Returns false when
    /// another worker already holds it.
    pub fn try_claim(
        &self,
        candidate_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let changed = conn.execute(
            "INSERT OR IGNORE INTO claims (candidate_id, worker_id, claimed_at) \
             VALUES (?1, ?2, ?3)",
            params![candidate_id, worker_id, now.timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    pub fn release_claim(&self, candidate_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM claims WHERE candidate_id = ?1",
            params![candidate_id],
        )?;
        Ok(())
    }

    /// Janitor sweep: free claims older than `cutoff` so their candidates
    /// become re-claimable. Returns the released candidate ids.
    pub fn release_stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt =
            conn.prepare("SELECT candidate_id FROM claims WHERE claimed_at < ?1")?;
        let stale: Vec<String> = stmt
            .query_map(params![cutoff.timestamp_millis()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        conn.execute(
            "DELETE FROM claims WHERE claimed_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(stale)
    }

    pub fn set_status(&self, candidate_id: &str, status: CandidateStatus) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE candidates SET status = ?1 WHERE id = ?2",
            params![status.as_str(), candidate_id],
        )?;
        Ok(())
    }

    pub fn delete_candidate(&self, candidate_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute("DELETE FROM candidates WHERE id = ?1", params![candidate_id])?;
        Ok(())
    }

    /// Persist the result of a full evaluation or retest.
    pub fn update_after_eval(
        &self,
        candidate_id: &str,
        parameters: &TradeParams,
        score: f64,
        evaluated_at: DateTime<Utc>,
        status: CandidateStatus,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "UPDATE candidates SET parameters = ?1, score_backtest = ?2, \
             last_evaluated_at = ?3, status = ?4 WHERE id = ?5",
            params![
                serde_json::to_string(parameters)?,
                score,
                evaluated_at.timestamp_millis(),
                status.as_str(),
                candidate_id,
            ],
        )?;
        Ok(())
    }

    pub fn candidate_count(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM candidates", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // --- evaluation events ---

    pub fn record_event(
        &self,
        candidate_id: &str,
        stage: Stage,
        outcome: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO evaluation_events (candidate_id, stage, outcome, reason, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                candidate_id,
                stage.as_str(),
                outcome,
                reason,
                at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn events_for(&self, candidate_id: &str) -> Result<Vec<EvaluationEvent>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT candidate_id, stage, outcome, reason, created_at \
             FROM evaluation_events WHERE candidate_id = ?1 ORDER BY id ASC",
        )?;
        let events = stmt
            .query_map(params![candidate_id], |row| {
                Ok(EvaluationEvent {
                    candidate_id: row.get(0)?,
                    stage: row.get(1)?,
                    outcome: row.get(2)?,
                    reason: row.get(3)?,
                    created_at: ms_to_utc(row.get(4)?),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(events)
    }

    // --- pool ---

    pub fn pool_entries(&self) -> Result<Vec<PoolEntry>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT candidate_id, score, last_evaluated_at FROM pool_entries \
             ORDER BY score DESC",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(PoolEntry {
                    candidate_id: row.get(0)?,
                    score: row.get(1)?,
                    last_evaluated_at: ms_to_utc(row.get(2)?),
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        Ok(entries)
    }
}

impl PoolPersistence for Store {
    fn upsert(&self, entry: &PoolEntry) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "INSERT INTO pool_entries (candidate_id, score, last_evaluated_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT(candidate_id) DO UPDATE SET score = ?2, last_evaluated_at = ?3",
            params![
                entry.candidate_id,
                entry.score,
                entry.last_evaluated_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    fn remove(&self, candidate_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            "DELETE FROM pool_entries WHERE candidate_id = ?1",
            params![candidate_id],
        )?;
        Ok(())
    }
}

impl VerdictCache for Store {
    fn get(&self, fingerprint: &str) -> Result<Option<ShuffleVerdict>> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let verdict = conn
            .query_row(
                "SELECT passed, similarity, computed_at FROM verdict_cache \
                 WHERE code_fingerprint = ?1",
                params![fingerprint],
                |row| {
                    Ok(ShuffleVerdict {
                        passed: row.get::<_, i64>(0)? != 0,
                        similarity: row.get(1)?,
                        computed_at: ms_to_utc(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(verdict)
    }

    fn put(&self, fingerprint: &str, verdict: &ShuffleVerdict) -> Result<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        // Overwrite-allowed-on-identical: the same fingerprint always maps
        // to the same verdict within a storage epoch
        conn.execute(
            "INSERT INTO verdict_cache (code_fingerprint, passed, similarity, computed_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(code_fingerprint) DO UPDATE SET passed = ?2, similarity = ?3, \
             computed_at = ?4",
            params![
                fingerprint,
                i64::from(verdict.passed),
                verdict.similarity,
                verdict.computed_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }
}

fn ms_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn candidate_from_row(row: &Row<'_>) -> rusqlite::Result<Candidate> {
    let timeframe_raw: String = row.get(4)?;
    let source_raw: String = row.get(5)?;
    let pattern_raw: Option<String> = row.get(6)?;
    let status_raw: String = row.get(7)?;
    let params_raw: Option<String> = row.get(8)?;

    let parse_err =
        |e: anyhow::Error| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into());

    let timeframe = Timeframe::parse(&timeframe_raw)
        .ok_or_else(|| parse_err(anyhow!("unknown timeframe {timeframe_raw}")))?;
    let source_class = SourceClass::parse(&source_raw)
        .ok_or_else(|| parse_err(anyhow!("unknown source class {source_raw}")))?;
    let status = CandidateStatus::parse(&status_raw)
        .ok_or_else(|| parse_err(anyhow!("unknown status {status_raw}")))?;
    let pattern: Option<PatternMeta> = pattern_raw
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| parse_err(e.into()))?;
    let parameters: Option<TradeParams> = params_raw
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| parse_err(e.into()))?;

    Ok(Candidate {
        id: row.get(0)?,
        name: row.get(1)?,
        code_blob: row.get(2)?,
        code_fingerprint: row.get(3)?,
        timeframe,
        source_class,
        pattern,
        status,
        parameters,
        score_backtest: row.get(9)?,
        created_at: ms_to_utc(row.get(10)?),
        last_evaluated_at: row
            .get::<_, Option<i64>>(11)?
            .map(ms_to_utc),
    })
}
