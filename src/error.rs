//! Typed errors for the pipeline core.
//!
//! Only `ConfigError` is fatal, and only at startup. Everything that can go
//! wrong while an item is in flight is contained to that item: adapter
//! failures become `ModelScore` entries, budget overruns become
//! `ItemOutcome::BudgetExceeded`.

use thiserror::Error;

use crate::latency::Stage;

/// Startup configuration rejected by `PipelineConfig::validate`.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no models configured")]
    NoModels,
    #[error("duplicate model id `{0}`")]
    DuplicateModel(String),
    #[error("model `{id}` has negative or non-finite weight {weight}")]
    InvalidWeight { id: String, weight: f64 },
    #[error("model weights must sum to 1.0, got {0:.6}")]
    WeightSum(f64),
    #[error("model `{0}` has a zero timeout")]
    ZeroTimeout(String),
    #[error("http model `{0}` is missing an endpoint")]
    MissingEndpoint(String),
    #[error("thresholds must satisfy -1 <= bear < bull <= 1 (bear={bear}, bull={bull})")]
    Thresholds { bear: f64, bull: f64 },
    #[error("{name} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("window_size must be at least 1")]
    EmptyWindow,
    #[error("momentum_min_points must be between 1 and window_size ({window}), got {points}")]
    MomentumPoints { points: usize, window: usize },
    #[error("cooldowns must satisfy 0 < initial ({initial}s) <= max ({max}s)")]
    Cooldown { initial: u64, max: u64 },
    #[error("breaker period must be positive")]
    ZeroPeriod,
    #[error("breaker.max_daily_trades must be at least 1")]
    ZeroTradeLimit,
    #[error("{name} must be at most {max}s, got {secs}s")]
    DurationTooLong { name: &'static str, secs: u64, max: u64 },
    #[error("total latency budget must be positive")]
    ZeroBudget,
    #[error("stage budgets sum to {sum}ms, exceeding total budget {total}ms")]
    StageBudgets { sum: u64, total: u64 },
    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Per-model scoring failure. Never aborts the fan-out.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdapterError {
    #[error("adapter timed out")]
    Timeout,
    #[error("adapter failed: {0}")]
    Failed(String),
    #[error("adapter returned out-of-range output (sentiment={sentiment}, confidence={confidence})")]
    InvalidOutput { sentiment: f64, confidence: f64 },
}

/// Raised by the latency tracker before a stage runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("latency budget exceeded before {stage} ({elapsed_ms}ms of {budget_ms}ms)")]
    BudgetExceeded {
        stage: Stage,
        elapsed_ms: u64,
        budget_ms: u64,
    },
}
