// src/config/pipeline.rs
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::aggregate::ModelWeights;
use crate::breaker::BreakerConfig;
use crate::error::ConfigError;
use crate::execution::ExecutionConfig;
use crate::latency::LatencyConfig;
use crate::signal::SignalConfig;

pub const CONFIG_PATH_ENV: &str = "PIPELINE_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";

const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Ceiling for every setting expressed in seconds (one leap year).
pub const MAX_DURATION_SECS: u64 = 366 * 86_400;

/// Seconds as a chrono delta, saturating at `MAX_DURATION_SECS`.
pub fn bounded_secs(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// In-process financial lexicon.
    Lexicon,
    /// Remote scorer behind a JSON endpoint.
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub weight: f64,
    #[serde(default = "default_model_timeout_ms")]
    pub timeout_ms: u64,
    pub kind: ModelKind,
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_model_timeout_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Max pairwise spread tolerated before confidence is scaled down.
    pub disagreement_threshold: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            disagreement_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub bus_capacity: usize,
    /// JSONL record log; `None` disables persistence.
    pub record_path: Option<PathBuf>,
    pub record_capacity: usize,
    /// Minimum gap between two alerts for the same breaker key.
    pub alert_cooldown_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            record_path: None,
            record_capacity: 4096,
            alert_cooldown_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub models: Vec<ModelConfig>,
    pub aggregation: AggregationConfig,
    pub signal: SignalConfig,
    pub breaker: BreakerConfig,
    pub latency: LatencyConfig,
    pub execution: ExecutionConfig,
    pub events: EventsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models: vec![ModelConfig {
                id: "lexicon".into(),
                weight: 1.0,
                timeout_ms: default_model_timeout_ms(),
                kind: ModelKind::Lexicon,
                endpoint: None,
            }],
            aggregation: AggregationConfig::default(),
            signal: SignalConfig::default(),
            breaker: BreakerConfig::default(),
            latency: LatencyConfig::default(),
            execution: ExecutionConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse and validate.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let cfg: PipelineConfig = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid pipeline config {}", path.display()))
    }

    /// Resolution order:
    /// 1) $PIPELINE_CONFIG_PATH (must exist)
    /// 2) config/pipeline.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{CONFIG_PATH_ENV} points to non-existent path"));
            }
            return Self::load_from_file(&pb);
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from_file(&default_p);
        }
        let cfg = Self::default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn weights(&self) -> ModelWeights {
        ModelWeights::new(self.models.iter().map(|m| (m.id.clone(), m.weight)))
    }

    /// First violation wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.models.is_empty() {
            return Err(ConfigError::NoModels);
        }
        let mut seen = HashSet::new();
        for m in &self.models {
            if !seen.insert(m.id.as_str()) {
                return Err(ConfigError::DuplicateModel(m.id.clone()));
            }
            if !m.weight.is_finite() || m.weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    id: m.id.clone(),
                    weight: m.weight,
                });
            }
            if m.timeout_ms == 0 {
                return Err(ConfigError::ZeroTimeout(m.id.clone()));
            }
            let has_endpoint = m.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty());
            if m.kind == ModelKind::Http && !has_endpoint {
                return Err(ConfigError::MissingEndpoint(m.id.clone()));
            }
        }
        let sum: f64 = self.models.iter().map(|m| m.weight).sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ConfigError::WeightSum(sum));
        }

        in_range(
            "aggregation.disagreement_threshold",
            self.aggregation.disagreement_threshold,
            0.0,
            2.0,
        )?;

        let s = &self.signal;
        let (bear, bull) = (s.threshold_bear, s.threshold_bull);
        if !(bear.is_finite() && bull.is_finite() && -1.0 <= bear && bear < bull && bull <= 1.0) {
            return Err(ConfigError::Thresholds { bear, bull });
        }
        in_range("signal.min_confidence", s.min_confidence, 0.0, 1.0)?;
        in_range("signal.volume_floor", s.volume_floor, 0.0, f64::MAX)?;
        in_range("signal.momentum_full_scale", s.momentum_full_scale, f64::MIN_POSITIVE, f64::MAX)?;
        if let Some(h) = s.window_horizon_secs {
            at_most("signal.window_horizon_secs", h)?;
        }
        at_most("signal.signal_cooldown_secs", s.signal_cooldown_secs)?;
        if s.window_size == 0 {
            return Err(ConfigError::EmptyWindow);
        }
        if s.momentum_min_points == 0 || s.momentum_min_points > s.window_size {
            return Err(ConfigError::MomentumPoints {
                points: s.momentum_min_points,
                window: s.window_size,
            });
        }

        let b = &self.breaker;
        if b.initial_cooldown_secs == 0 || b.max_cooldown_secs < b.initial_cooldown_secs {
            return Err(ConfigError::Cooldown {
                initial: b.initial_cooldown_secs,
                max: b.max_cooldown_secs,
            });
        }
        at_most("breaker.max_cooldown_secs", b.max_cooldown_secs)?;
        if b.period_secs == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        at_most("breaker.period_secs", b.period_secs)?;
        if b.max_daily_trades == 0 {
            return Err(ConfigError::ZeroTradeLimit);
        }
        in_range("breaker.drawdown_limit", b.drawdown_limit, 0.0, f64::MAX)?;

        let l = &self.latency;
        if l.total_ms == 0 {
            return Err(ConfigError::ZeroBudget);
        }
        if l.stage_sum_ms() > l.total_ms {
            return Err(ConfigError::StageBudgets {
                sum: l.stage_sum_ms(),
                total: l.total_ms,
            });
        }

        in_range(
            "execution.max_position_size",
            self.execution.max_position_size,
            f64::MIN_POSITIVE,
            f64::MAX,
        )?;
        at_most("events.alert_cooldown_secs", self.events.alert_cooldown_secs)?;
        Ok(())
    }
}

fn at_most(name: &'static str, secs: u64) -> Result<(), ConfigError> {
    if secs <= MAX_DURATION_SECS {
        Ok(())
    } else {
        Err(ConfigError::DurationTooLong {
            name,
            secs,
            max: MAX_DURATION_SECS,
        })
    }
}

fn in_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}
