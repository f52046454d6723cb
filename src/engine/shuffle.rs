use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::market::series::OhlcvSeries;
use crate::strategy::script::ScriptStrategy;
use crate::strategy::Signal;

/// Outcome of the empirical lookahead check for one code fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleVerdict {
    pub passed: bool,
    /// Mean similarity between the original and shuffled signal
    /// distributions across all iterations (1 = indistinguishable).
    pub similarity: f64,
    pub computed_at: DateTime<Utc>,
}

/// Durable verdict store keyed on `code_fingerprint`. Writes are idempotent:
/// the same fingerprint always maps to the same verdict within an epoch.
pub trait VerdictCache: Send + Sync {
    fn get(&self, fingerprint: &str) -> Result<Option<ShuffleVerdict>>;
    fn put(&self, fingerprint: &str, verdict: &ShuffleVerdict) -> Result<()>;
}

/// Empirical lookahead tester.
///
/// Lookahead is a property of the base logic, not the parameter values, so
/// the verdict is keyed on the code fingerprint and parametric siblings
/// share it. An in-memory map fronts the durable cache so the common case
/// is a wait-free hit.
pub struct ShuffleTester {
    iterations: usize,
    max_similarity: f64,
    memo: DashMap<String, ShuffleVerdict>,
    durable: Arc<dyn VerdictCache>,
}

impl ShuffleTester {
    pub fn new(iterations: usize, max_similarity: f64, durable: Arc<dyn VerdictCache>) -> Self {
        Self {
            iterations,
            max_similarity,
            memo: DashMap::new(),
            durable,
        }
    }

    /// Run (or recall) the shuffle check for a fingerprint against the
    /// reference series.
    pub fn run(
        &self,
        fingerprint: &str,
        program: &ScriptStrategy,
        series: &OhlcvSeries,
    ) -> Result<ShuffleVerdict> {
        if let Some(hit) = self.memo.get(fingerprint) {
            return Ok(hit.clone());
        }
        if let Some(hit) = self.durable.get(fingerprint)? {
            self.memo.insert(fingerprint.to_string(), hit.clone());
            return Ok(hit);
        }

        let verdict = self.compute(fingerprint, program, series)?;
        self.durable.put(fingerprint, &verdict)?;
        self.memo.insert(fingerprint.to_string(), verdict.clone());
        Ok(verdict)
    }

    /// A legitimate strategy conditions on temporal structure, so destroying
    /// that structure must change what it signals. Per iteration the rows
    /// are permuted, signals recomputed, and the two signal distributions
    /// compared; a distribution insensitive to temporal order is presumed to
    /// be reading future values.
    fn compute(
        &self,
        fingerprint: &str,
        program: &ScriptStrategy,
        series: &OhlcvSeries,
    ) -> Result<ShuffleVerdict> {
        let original = program.signals(series)?;
        let original_hist = histogram(&original);

        // Seeded from the fingerprint so reruns reproduce bit-for-bit
        let mut rng = StdRng::seed_from_u64(fingerprint_seed(fingerprint));
        let mut indices: Vec<usize> = (0..series.len()).collect();

        let mut similarities = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            indices.shuffle(&mut rng);
            let shuffled = series.permute_rows(&indices);
            let signals = program.signals(&shuffled)?;
            let distance = total_variation(&original_hist, &histogram(&signals));
            similarities.push(1.0 - distance);
        }

        let mean = similarities.iter().sum::<f64>() / similarities.len() as f64;
        let passed = mean < self.max_similarity;

        if let Some(z) = z_statistic(&similarities, self.max_similarity) {
            let normal = Normal::new(0.0, 1.0).expect("unit normal");
            tracing::debug!(
                %fingerprint,
                similarity = mean,
                z,
                p_below_boundary = normal.cdf(-z),
                "shuffle statistics"
            );
        }
        tracing::info!(%fingerprint, similarity = mean, passed, "shuffle verdict");

        Ok(ShuffleVerdict {
            passed,
            similarity: mean,
            computed_at: Utc::now(),
        })
    }
}

/// Signal-frequency histogram in a fixed variant order.
fn histogram(signals: &[Signal]) -> [f64; 4] {
    let mut counts = [0usize; 4];
    for s in signals {
        let slot = match s {
            Signal::OpenLong => 0,
            Signal::OpenShort => 1,
            Signal::Close => 2,
            Signal::Hold => 3,
        };
        counts[slot] += 1;
    }
    let total = signals.len().max(1) as f64;
    [
        counts[0] as f64 / total,
        counts[1] as f64 / total,
        counts[2] as f64 / total,
        counts[3] as f64 / total,
    ]
}

fn total_variation(a: &[f64; 4], b: &[f64; 4]) -> f64 {
    0.5 * a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum::<f64>()
}

/// Standardized distance of the mean similarity from the pass boundary.
fn z_statistic(similarities: &[f64], boundary: f64) -> Option<f64> {
    if similarities.len() < 2 {
        return None;
    }
    let n = similarities.len() as f64;
    let mean = similarities.iter().sum::<f64>() / n;
    let var = similarities.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let se = (var / n).sqrt();
    if se < 1e-12 {
        return None;
    }
    Some((mean - boundary) / se)
}

/// Stable u64 seed derived from the fingerprint string.
pub fn fingerprint_seed(fingerprint: &str) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    fingerprint.hash(&mut hasher);
    hasher.finish()
}
