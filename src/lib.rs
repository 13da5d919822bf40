// src/lib.rs
// Public library surface for the service, the replay tool and integration tests.

pub mod adapters;
pub mod aggregate;
pub mod api;
pub mod breaker;
pub mod config;
pub mod content;
pub mod ensemble;
pub mod error;
pub mod events;
pub mod execution;
pub mod latency;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod rolling;
pub mod sequencer;
pub mod signal;
pub mod telemetry;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

pub use crate::api::create_router as router;
pub use crate::config::PipelineConfig;
pub use crate::content::{ContentItem, IntakeItem};
pub use crate::pipeline::{ItemOutcome, ItemReport, Pipeline};

use crate::events::{NullRecorder, Recorder};
use crate::execution::ExecutionDispatcher;

/// Build the pipeline from a validated config: one adapter per model plus
/// the JSONL recorder when `events.record_path` is set. Must run inside a
/// Tokio runtime; the recorder task (if any) is returned for shutdown.
pub fn build_pipeline(
    config: Arc<PipelineConfig>,
    dispatcher: Arc<dyn ExecutionDispatcher>,
) -> anyhow::Result<(Arc<Pipeline>, Option<JoinHandle<anyhow::Result<()>>>)> {
    let adapters = adapters::build_adapters(&config.models)?;

    let (recorder, writer): (Arc<dyn Recorder>, _) = match &config.events.record_path {
        Some(path) => {
            let (rec, handle) = events::jsonl_recorder(path, config.events.record_capacity);
            info!(path = %path.display(), "recording to JSONL");
            (Arc::new(rec), Some(handle))
        }
        None => (Arc::new(NullRecorder), None),
    };

    let pipeline = Arc::new(Pipeline::new(config, adapters, dispatcher, recorder));
    Ok((pipeline, writer))
}
