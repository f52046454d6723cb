pub mod script;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::market::series::Timeframe;

/// Per-bar strategy output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    OpenLong,
    OpenShort,
    Close,
    Hold,
}

/// Where a candidate's logic came from; controls parameter-space
/// construction and coin selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceClass {
    PatternDerived,
    Free,
    IndicatorAssigned,
    PatternGenerated,
    CatalogBased,
    GeneticEvolved,
}

impl SourceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceClass::PatternDerived => "pattern_derived",
            SourceClass::Free => "free",
            SourceClass::IndicatorAssigned => "indicator_assigned",
            SourceClass::PatternGenerated => "pattern_generated",
            SourceClass::CatalogBased => "catalog_based",
            SourceClass::GeneticEvolved => "genetic_evolved",
        }
    }

    pub fn parse(s: &str) -> Option<SourceClass> {
        match s {
            "pattern_derived" => Some(SourceClass::PatternDerived),
            "free" => Some(SourceClass::Free),
            "indicator_assigned" => Some(SourceClass::IndicatorAssigned),
            "pattern_generated" => Some(SourceClass::PatternGenerated),
            "catalog_based" => Some(SourceClass::CatalogBased),
            "genetic_evolved" => Some(SourceClass::GeneticEvolved),
            _ => None,
        }
    }

    /// Three-letter tag embedded in candidate names.
    pub fn tag(self) -> &'static str {
        match self {
            SourceClass::PatternDerived => "PAT",
            SourceClass::Free => "FRE",
            SourceClass::IndicatorAssigned => "IND",
            SourceClass::PatternGenerated => "PGN",
            SourceClass::CatalogBased => "CAT",
            SourceClass::GeneticEvolved => "GEN",
        }
    }
}

/// How a pattern was validated, which changes which parameters are worth
/// optimizing (touch patterns target a level, close patterns ride time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    TouchBased,
    CloseBased,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinPreference {
    pub symbol: String,
    pub edge: f64,
    pub signal_count: u32,
}

/// Metadata attached to pattern-derived candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMeta {
    /// Fractional magnitude of the pattern's measured move (e.g. 0.06 = 6%).
    pub base_tp_magnitude: f64,
    pub suggested_rr_ratio: f64,
    pub base_holding_bars: u32,
    pub execution_type: Option<ExecutionType>,
    pub preferred_coins: Vec<CoinPreference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Generated,
    Validated,
    Active,
    Live,
    Retired,
    Failed,
}

impl CandidateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateStatus::Generated => "generated",
            CandidateStatus::Validated => "validated",
            CandidateStatus::Active => "active",
            CandidateStatus::Live => "live",
            CandidateStatus::Retired => "retired",
            CandidateStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<CandidateStatus> {
        match s {
            "generated" => Some(CandidateStatus::Generated),
            "validated" => Some(CandidateStatus::Validated),
            "active" => Some(CandidateStatus::Active),
            "live" => Some(CandidateStatus::Live),
            "retired" => Some(CandidateStatus::Retired),
            "failed" => Some(CandidateStatus::Failed),
            _ => None,
        }
    }
}

/// Execution parameters selected by the optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeParams {
    /// Stop-loss distance as a fraction of entry price.
    pub sl_pct: f64,
    /// Take-profit distance as a fraction of entry price; 0 disables it.
    pub tp_pct: f64,
    pub leverage: f64,
    /// Bars-held time exit; 0 disables it.
    pub exit_bars: u32,
}

/// A strategy candidate as delivered by the upstream generator+validator
/// chain. The funnel reads rows with status `validated` and owns every
/// downstream transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub code_blob: String,
    /// Stable content hash of the base code before parameter substitution;
    /// the shuffle-verdict cache key.
    pub code_fingerprint: String,
    pub timeframe: Timeframe,
    pub source_class: SourceClass,
    pub pattern: Option<PatternMeta>,
    pub status: CandidateStatus,
    pub parameters: Option<TradeParams>,
    pub score_backtest: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

impl Candidate {
    /// Preferred coins ordered by edge descending; empty for non-pattern
    /// candidates.
    pub fn preferred_symbols(&self, limit: usize) -> Vec<String> {
        let Some(meta) = &self.pattern else {
            return Vec::new();
        };
        let mut prefs: Vec<&CoinPreference> = meta.preferred_coins.iter().collect();
        prefs.sort_by(|a, b| b.edge.partial_cmp(&a.edge).unwrap_or(std::cmp::Ordering::Equal));
        prefs.into_iter().take(limit).map(|p| p.symbol.clone()).collect()
    }
}
