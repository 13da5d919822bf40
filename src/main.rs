//! Sentiment gate service: binary entrypoint.
//! Boots the Axum HTTP server with the pipeline, metrics and breaker alerts.

use std::sync::Arc;

use anyhow::Context;
use shuttle_axum::ShuttleAxum;

use sentiment_gate::api::{create_router, AppState};
use sentiment_gate::execution::PaperDispatcher;
use sentiment_gate::metrics::Metrics;
use sentiment_gate::notify::{spawn_breaker_alerts, NotifierMux};
use sentiment_gate::{build_pipeline, telemetry, PipelineConfig};

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    // Invalid config: refuse to start.
    let config = PipelineConfig::load_default().context("loading pipeline config")?;
    let config = Arc::new(config);

    let metrics = Metrics::init(&config)?;
    let (pipeline, _recorder) = build_pipeline(Arc::clone(&config), Arc::new(PaperDispatcher::new()))?;

    let mux = NotifierMux::from_env();
    if mux.is_empty() {
        tracing::info!("breaker alerts disabled (no webhook configured)");
    } else {
        tracing::info!(notifiers = mux.len(), "breaker alerts enabled");
        spawn_breaker_alerts(
            mux,
            pipeline.subscribe(),
            config.events.alert_cooldown_secs as i64,
        );
    }

    let router = create_router(AppState { pipeline }).merge(metrics.router());
    Ok(router.into())
}
