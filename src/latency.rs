//! # Latency Budget
//! Per-item deadline propagation, started when a content item arrives.
//!
//! Every stage asks the budget for permission before it runs. If nothing is
//! left the item is abandoned with `BudgetExceeded`; otherwise the stage gets
//! `min(stage sub-budget, remaining)` as its own ceiling, so no stage can
//! outlive the global budget even if its default timeout is longer.

use std::fmt;
use std::time::Duration;

use metrics::histogram;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::PipelineError;

/// Pipeline stages that run under a sub-budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FanOut,
    Aggregate,
    Signal,
    Dispatch,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::FanOut, Stage::Aggregate, Stage::Signal, Stage::Dispatch];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FanOut => "fan_out",
            Stage::Aggregate => "aggregate",
            Stage::Signal => "signal",
            Stage::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Total budget plus the default slice each stage may use.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub total_ms: u64,
    pub fan_out_ms: u64,
    pub aggregate_ms: u64,
    pub signal_ms: u64,
    pub dispatch_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            total_ms: 200,
            fan_out_ms: 120,
            aggregate_ms: 10,
            signal_ms: 20,
            dispatch_ms: 50,
        }
    }
}

impl LatencyConfig {
    pub fn total(&self) -> Duration {
        Duration::from_millis(self.total_ms)
    }

    pub fn stage_budget(&self, stage: Stage) -> Duration {
        let ms = match stage {
            Stage::FanOut => self.fan_out_ms,
            Stage::Aggregate => self.aggregate_ms,
            Stage::Signal => self.signal_ms,
            Stage::Dispatch => self.dispatch_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn stage_sum_ms(&self) -> u64 {
        self.fan_out_ms
            .saturating_add(self.aggregate_ms)
            .saturating_add(self.signal_ms)
            .saturating_add(self.dispatch_ms)
    }
}

/// Clock for one item, shared by all its per-ticker flows.
#[derive(Debug, Clone, Copy)]
pub struct LatencyBudget {
    arrival: Instant,
    config: LatencyConfig,
}

impl LatencyBudget {
    /// Start the clock now.
    pub fn start(config: LatencyConfig) -> Self {
        Self::starting_at(Instant::now(), config)
    }

    pub fn starting_at(arrival: Instant, config: LatencyConfig) -> Self {
        Self { arrival, config }
    }

    pub fn arrival(&self) -> Instant {
        self.arrival
    }

    pub fn elapsed(&self) -> Duration {
        self.arrival.elapsed()
    }

    /// `total - elapsed`, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.config.total().saturating_sub(self.elapsed())
    }

    /// Absolute end of the global budget.
    pub fn deadline(&self) -> Instant {
        self.arrival + self.config.total()
    }

    /// Gate for `stage`. Fails when nothing is left of the global budget.
    pub fn enter(&self, stage: Stage) -> Result<StageClock, PipelineError> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(self.exceeded(stage));
        }
        let budget = self.config.stage_budget(stage);
        Ok(StageClock {
            stage,
            started: Instant::now(),
            ceiling: budget.min(remaining),
            budget,
        })
    }

    pub fn exceeded(&self, stage: Stage) -> PipelineError {
        PipelineError::BudgetExceeded {
            stage,
            elapsed_ms: self.elapsed().as_millis() as u64,
            budget_ms: self.config.total_ms,
        }
    }
}

/// A running stage. `ceiling` is the most it may take.
#[derive(Debug)]
pub struct StageClock {
    stage: Stage,
    started: Instant,
    ceiling: Duration,
    budget: Duration,
}

impl StageClock {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.ceiling
    }

    /// Close the stage: records its latency and warns on sub-budget overrun.
    pub fn finish(self) -> Duration {
        let took = self.started.elapsed();
        let ms = took.as_secs_f64() * 1000.0;
        histogram!("stage_latency_ms", "stage" => self.stage.as_str()).record(ms);
        if took > self.budget {
            tracing::warn!(
                target: "pipeline",
                stage = self.stage.as_str(),
                elapsed_ms = ms,
                budget_ms = self.budget.as_millis() as u64,
                "stage exceeded its sub-budget"
            );
        }
        took
    }
}
