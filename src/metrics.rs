use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::config::PipelineConfig;

/// Latency histograms are exported as summaries with these quantiles.
const QUANTILES: &[f64] = &[0.5, 0.95, 0.99];

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the process-wide Prometheus recorder. Fails if one is already
    /// installed.
    pub fn init(cfg: &PipelineConfig) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_quantiles(QUANTILES)
            .context("prometheus: quantiles")?
            .install_recorder()
            .context("prometheus: install recorder")?;

        ensure_metrics_described();

        // Static gauges with the active limits.
        gauge!("pipeline_latency_budget_ms").set(cfg.latency.total_ms as f64);
        gauge!("pipeline_models").set(cfg.models.len() as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_items_total", "Content items accepted at intake.");
        describe_counter!(
            "pipeline_budget_exceeded_total",
            "Item flows abandoned because the latency budget ran out, by stage."
        );
        describe_counter!(
            "adapter_scores_total",
            "Model adapter results by model and status (ok/timeout/error)."
        );
        describe_counter!(
            "aggregation_inconclusive_total",
            "Aggregations with no usable model score."
        );
        describe_counter!("signals_total", "Trade signals generated, by direction.");
        describe_counter!(
            "signals_suppressed_total",
            "Signals suppressed by cooldown or circuit breaker."
        );
        describe_counter!(
            "breaker_transitions_total",
            "Circuit breaker phase changes, by target phase."
        );
        describe_counter!("intents_dispatched_total", "Trade intents handed to execution.");
        describe_counter!("execution_rejected_total", "Intents rejected or timed out at dispatch.");
        describe_counter!("events_dropped_total", "Records dropped by a full sink.");
        describe_histogram!("adapter_latency_ms", "Per-model scoring latency in milliseconds.");
        describe_histogram!("stage_latency_ms", "Per-stage latency in milliseconds.");
        describe_histogram!(
            "pipeline_latency_ms",
            "Intake-to-outcome latency per item in milliseconds."
        );
        describe_gauge!("pipeline_latency_budget_ms", "Configured end-to-end latency budget.");
        describe_gauge!("pipeline_models", "Number of configured model adapters.");
    });
}
