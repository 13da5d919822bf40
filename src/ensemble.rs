//! # Ensemble Fan-out
//! Sends one piece of text to every configured adapter at once and joins the
//! results at a single stage deadline.
//!
//! Each adapter runs on its own task, bounded by
//! `min(adapter timeout, stage deadline)`. When the stage deadline passes,
//! whatever is still running is aborted and recorded as `timeout`. Every
//! adapter gets exactly one `ModelScore` back, in adapter order.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::adapters::{DynAdapter, RawScore};
use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStatus {
    Ok,
    Timeout,
    Error,
}

impl ScoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreStatus::Ok => "ok",
            ScoreStatus::Timeout => "timeout",
            ScoreStatus::Error => "error",
        }
    }
}

/// One adapter's verdict on one item. Failed entries keep `sentiment` and
/// `confidence` at zero and are excluded from aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelScore {
    pub model_id: String,
    pub sentiment: f64,
    pub confidence: f64,
    pub latency_ms: f64,
    pub status: ScoreStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelScore {
    pub fn ok(model_id: impl Into<String>, raw: RawScore, latency: Duration) -> Self {
        Self {
            model_id: model_id.into(),
            sentiment: raw.sentiment,
            confidence: raw.confidence,
            latency_ms: latency.as_secs_f64() * 1000.0,
            status: ScoreStatus::Ok,
            error: None,
        }
    }

    pub fn failed(model_id: impl Into<String>, err: &AdapterError, latency: Duration) -> Self {
        let status = match err {
            AdapterError::Timeout => ScoreStatus::Timeout,
            _ => ScoreStatus::Error,
        };
        Self {
            model_id: model_id.into(),
            sentiment: 0.0,
            confidence: 0.0,
            latency_ms: latency.as_secs_f64() * 1000.0,
            status,
            error: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ScoreStatus::Ok
    }
}

/// Score `text` for `ticker` on all adapters concurrently.
///
/// Returns when every adapter has answered or `stage_deadline` has elapsed,
/// whichever comes first. An empty adapter list yields an empty result.
pub async fn fan_out(
    text: &str,
    ticker: &str,
    adapters: &[DynAdapter],
    stage_deadline: Duration,
) -> Vec<ModelScore> {
    if adapters.is_empty() {
        return Vec::new();
    }

    let started = Instant::now();
    let stage_end = started + stage_deadline;
    let text: Arc<str> = Arc::from(text);
    let ticker: Arc<str> = Arc::from(ticker);

    let mut handles: Vec<JoinHandle<Result<RawScore, AdapterError>>> =
        Vec::with_capacity(adapters.len());
    for adapter in adapters {
        let adapter = Arc::clone(adapter);
        let text = Arc::clone(&text);
        let ticker = Arc::clone(&ticker);
        let bound = adapter.timeout().min(stage_deadline);
        handles.push(tokio::spawn(async move {
            match tokio::time::timeout(bound, adapter.score(&text, &ticker, bound)).await {
                Ok(res) => res,
                Err(_) => Err(AdapterError::Timeout),
            }
        }));
    }

    let mut slots: Vec<Option<ModelScore>> = vec![None; adapters.len()];
    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    let mut pending: FuturesUnordered<_> = handles
        .into_iter()
        .enumerate()
        .map(|(idx, h)| async move { (idx, h.await) })
        .collect();

    loop {
        match tokio::time::timeout_at(stage_end, pending.next()).await {
            Ok(Some((idx, joined))) => {
                let id = adapters[idx].id();
                let latency = started.elapsed();
                let score = match joined {
                    Ok(Ok(raw)) => ModelScore::ok(id, raw, latency),
                    Ok(Err(e)) => ModelScore::failed(id, &e, latency),
                    Err(join_err) => ModelScore::failed(
                        id,
                        &AdapterError::Failed(format!("adapter task: {join_err}")),
                        latency,
                    ),
                };
                slots[idx] = Some(score);
            }
            Ok(None) => break,
            Err(_) => {
                // Stage deadline: abandon everything still outstanding.
                for (idx, slot) in slots.iter().enumerate() {
                    if slot.is_none() {
                        aborts[idx].abort();
                    }
                }
                break;
            }
        }
    }

    let abandoned_at = started.elapsed();
    let scores: Vec<ModelScore> = slots
        .into_iter()
        .zip(adapters)
        .map(|(slot, adapter)| {
            slot.unwrap_or_else(|| {
                ModelScore::failed(adapter.id(), &AdapterError::Timeout, abandoned_at)
            })
        })
        .collect();

    for s in &scores {
        counter!(
            "adapter_scores_total",
            "model" => s.model_id.clone(),
            "status" => s.status.as_str()
        )
        .increment(1);
        histogram!("adapter_latency_ms", "model" => s.model_id.clone()).record(s.latency_ms);
        if !s.is_ok() {
            tracing::debug!(
                target: "ensemble",
                model = %s.model_id,
                status = s.status.as_str(),
                error = s.error.as_deref().unwrap_or(""),
                "adapter excluded from consensus"
            );
        }
    }

    scores
}
