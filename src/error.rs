use serde::{Deserialize, Serialize};

/// Errors raised by the simulation kernel itself. Everything else in the
/// funnel is expressed as a [`RejectReason`] rather than an error: a candidate
/// failing a threshold is an expected outcome, not a fault.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("insufficient data: {available} bars available, {required} required")]
    InsufficientData { required: usize, available: usize },
    #[error("symbol series are not aligned on a shared timeline")]
    MisalignedSeries,
    #[error("invalid trade parameters: {0}")]
    InvalidParams(&'static str),
}

/// Closed taxonomy of per-candidate rejection reasons. Persisted events store
/// the machine-readable [`code`](RejectReason::code), never free-form text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    InsufficientData,
    NoComboPassed,
    ZeroTradesInSample,
    IsTradesTooFew,
    IsSharpeTooLow,
    IsWinRateTooLow,
    IsExpectancyTooLow,
    IsDrawdownTooHigh,
    OosTradesTooFew,
    OosSharpeTooLow,
    OosWinRateTooLow,
    OosExpectancyTooLow,
    OosDrawdownTooHigh,
    OosOverfitted,
    ScoreBelowThreshold,
    ShuffleFailed,
    WfaFailed { passed: u32, required: u32 },
    PoolRejected,
}

impl RejectReason {
    pub fn code(&self) -> String {
        match self {
            RejectReason::InsufficientData => "insufficient_data".into(),
            RejectReason::NoComboPassed => "no_combo_passed".into(),
            RejectReason::ZeroTradesInSample => "zero_trades_is".into(),
            RejectReason::IsTradesTooFew => "is_trades_too_few".into(),
            RejectReason::IsSharpeTooLow => "is_sharpe_too_low".into(),
            RejectReason::IsWinRateTooLow => "is_wr_too_low".into(),
            RejectReason::IsExpectancyTooLow => "is_expectancy_too_low".into(),
            RejectReason::IsDrawdownTooHigh => "is_drawdown_too_high".into(),
            RejectReason::OosTradesTooFew => "oos_trades_too_few".into(),
            RejectReason::OosSharpeTooLow => "oos_sharpe_too_low".into(),
            RejectReason::OosWinRateTooLow => "oos_wr_too_low".into(),
            RejectReason::OosExpectancyTooLow => "oos_expectancy_too_low".into(),
            RejectReason::OosDrawdownTooHigh => "oos_drawdown_too_high".into(),
            RejectReason::OosOverfitted => "oos_overfitted".into(),
            RejectReason::ScoreBelowThreshold => "score_below_threshold".into(),
            RejectReason::ShuffleFailed => "shuffle_failed".into(),
            RejectReason::WfaFailed { passed, required } => {
                format!("insufficient_profitable_windows:{passed}/{required}")
            }
            RejectReason::PoolRejected => "pool_rejected".into(),
        }
    }

    /// Whether the candidate row is deleted outright (no residual value) or
    /// kept as `retired` (code/metadata may still be informative).
    pub fn deletes_candidate(&self) -> bool {
        matches!(
            self,
            RejectReason::InsufficientData
                | RejectReason::NoComboPassed
                | RejectReason::ZeroTradesInSample
                | RejectReason::IsTradesTooFew
                | RejectReason::IsSharpeTooLow
                | RejectReason::IsWinRateTooLow
                | RejectReason::IsExpectancyTooLow
                | RejectReason::IsDrawdownTooHigh
                | RejectReason::OosTradesTooFew
                | RejectReason::OosSharpeTooLow
                | RejectReason::OosWinRateTooLow
                | RejectReason::OosExpectancyTooLow
                | RejectReason::OosDrawdownTooHigh
                | RejectReason::OosOverfitted
        )
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Funnel stages as recorded in the evaluation event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Optimize,
    Evaluate,
    Score,
    Shuffle,
    WalkForward,
    PoolAdmission,
    Retest,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Optimize => "optimize",
            Stage::Evaluate => "evaluate",
            Stage::Score => "score",
            Stage::Shuffle => "shuffle",
            Stage::WalkForward => "walk_forward",
            Stage::PoolAdmission => "pool_admission",
            Stage::Retest => "retest",
        }
    }
}
