//! Startup configuration. Loaded once, validated, then shared read-only.

mod pipeline;

pub use pipeline::{
    bounded_secs, AggregationConfig, EventsConfig, ModelConfig, ModelKind, PipelineConfig, CONFIG_PATH_ENV,
    DEFAULT_CONFIG_PATH, MAX_DURATION_SECS,
};
