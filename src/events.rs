//! Outbound, fire-and-forget streams.
//!
//! * `EventBus`: typed events for dashboards and alerting. Broadcast; a
//!   slow subscriber only lags itself, it never slows the core.
//! * `Recorder`: durable log of sentiment, signals, intents and outcomes.
//!   The JSONL recorder writes on its own task behind a bounded channel and
//!   drops (and counts) records when the writer falls behind.

use std::path::PathBuf;

use anyhow::Context;
use metrics::counter;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::aggregate::AggregatedSentiment;
use crate::breaker::{Phase, Transition};
use crate::ensemble::ModelScore;
use crate::execution::{ExecutionOutcome, TradeIntent};
use crate::latency::Stage;
use crate::signal::TradeSignal;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    SentimentUpdate {
        item_id: Uuid,
        sentiment: AggregatedSentiment,
        scores: Vec<ModelScore>,
    },
    InconclusiveAggregation {
        item_id: Uuid,
        ticker: String,
        scores: Vec<ModelScore>,
    },
    SignalGenerated {
        item_id: Uuid,
        signal: TradeSignal,
    },
    /// A non-hold signal stopped by the circuit breaker.
    SignalSuppressed {
        item_id: Uuid,
        signal: TradeSignal,
        phase: Phase,
    },
    TradeExecuted {
        intent: TradeIntent,
        outcome: ExecutionOutcome,
    },
    CircuitBreakerStateChanged {
        transition: Transition,
    },
    LatencyExceeded {
        item_id: Uuid,
        ticker: String,
        stage: Stage,
        elapsed_ms: u64,
        budget_ms: u64,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::SentimentUpdate { .. } => "sentiment_update",
            PipelineEvent::InconclusiveAggregation { .. } => "inconclusive_aggregation",
            PipelineEvent::SignalGenerated { .. } => "signal_generated",
            PipelineEvent::SignalSuppressed { .. } => "signal_suppressed",
            PipelineEvent::TradeExecuted { .. } => "trade_executed",
            PipelineEvent::CircuitBreakerStateChanged { .. } => "circuit_breaker_state_changed",
            PipelineEvent::LatencyExceeded { .. } => "latency_exceeded",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Never blocks; having no subscribers is fine.
    pub fn publish(&self, ev: PipelineEvent) {
        let _ = self.tx.send(ev);
    }
}

/// Persistence records, one JSON object per line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Sentiment(AggregatedSentiment),
    Signal(TradeSignal),
    Intent(TradeIntent),
    Outcome {
        intent_id: Uuid,
        ticker: String,
        outcome: ExecutionOutcome,
    },
}

pub trait Recorder: Send + Sync {
    /// Must not block the caller.
    fn record(&self, rec: Record);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRecorder;

impl Recorder for NullRecorder {
    fn record(&self, _rec: Record) {}
}

/// Bounded hand-off to whatever drains the receiver.
#[derive(Debug, Clone)]
pub struct ChannelRecorder {
    tx: mpsc::Sender<Record>,
}

impl ChannelRecorder {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Recorder for ChannelRecorder {
    fn record(&self, rec: Record) {
        if let Err(e) = self.tx.try_send(rec) {
            counter!("events_dropped_total", "sink" => "recorder").increment(1);
            tracing::debug!(target: "pipeline", error = %e, "recorder backlog full, record dropped");
        }
    }
}

/// Recorder appending JSON lines to `path`, plus the writer task.
pub fn jsonl_recorder(
    path: impl Into<PathBuf>,
    capacity: usize,
) -> (ChannelRecorder, JoinHandle<anyhow::Result<()>>) {
    let (recorder, rx) = ChannelRecorder::new(capacity);
    let handle = tokio::spawn(write_jsonl(path.into(), rx));
    (recorder, handle)
}

async fn write_jsonl(path: PathBuf, mut rx: mpsc::Receiver<Record>) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;

    while let Some(rec) = rx.recv().await {
        let mut line = match serde_json::to_vec(&rec) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(target: "pipeline", error = %e, "unserializable record skipped");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = file.write_all(&line).await {
            tracing::warn!(target: "pipeline", error = %e, path = %path.display(), "record write failed");
        }
    }
    file.flush().await.context("flushing record log")?;
    Ok(())
}
