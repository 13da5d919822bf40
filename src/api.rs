use std::sync::Arc;

use serde::{Deserialize, Serialize};
use shuttle_axum::axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::breaker::{Phase, Transition};
use crate::content::IntakeItem;
use crate::execution::ExecutionOutcome;
use crate::pipeline::{Pipeline, PipelineSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/intake", post(intake))
        .route("/outcome", post(outcome))
        .route("/state", get(state_snapshot))
        .route("/breaker/{ticker}", get(breaker_phase))
        .route(
            "/breaker/{ticker}/override",
            post(assert_override).delete(clear_override),
        )
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Deserialize, Default)]
struct IntakeQuery {
    /// Wait for the item to finish and return its report.
    #[serde(default)]
    wait: bool,
}

#[derive(Serialize)]
struct Accepted {
    item_id: Uuid,
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn api_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError { error: msg.into() })).into_response()
}

async fn intake(
    State(state): State<AppState>,
    Query(q): Query<IntakeQuery>,
    Json(body): Json<IntakeItem>,
) -> Response {
    let Some(item) = body.into_content() else {
        tracing::info!(target: "pipeline", "intake rejected: empty text or no ticker");
        return api_error(StatusCode::UNPROCESSABLE_ENTITY, "item needs text and at least one ticker");
    };
    let item_id = item.id;
    let handle = state.pipeline.intake(item);
    if !q.wait {
        return (StatusCode::ACCEPTED, Json(Accepted { item_id })).into_response();
    }
    match handle.await {
        Ok(report) => Json(report).into_response(),
        Err(e) => {
            tracing::error!(target: "pipeline", item_id = %item_id, error = %e, "item task failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "item processing failed")
        }
    }
}

#[derive(Deserialize)]
struct OutcomeReq {
    ticker: String,
    intent_id: Uuid,
    outcome: ExecutionOutcome,
}

#[derive(Serialize)]
struct BreakerResp {
    ticker: String,
    phase: Phase,
    transitions: Vec<Transition>,
}

async fn outcome(State(state): State<AppState>, Json(body): Json<OutcomeReq>) -> Json<BreakerResp> {
    let ticker = body.ticker.trim().to_ascii_uppercase();
    let transitions = state.pipeline.report_outcome(&ticker, body.intent_id, body.outcome);
    let phase = state.pipeline.breaker_phase(&ticker);
    Json(BreakerResp {
        ticker,
        phase,
        transitions,
    })
}

async fn state_snapshot(State(state): State<AppState>) -> Json<PipelineSnapshot> {
    Json(state.pipeline.snapshot())
}

async fn breaker_phase(State(state): State<AppState>, Path(ticker): Path<String>) -> Json<BreakerResp> {
    let ticker = ticker.to_ascii_uppercase();
    let phase = state.pipeline.breaker_phase(&ticker);
    Json(BreakerResp {
        ticker,
        phase,
        transitions: Vec::new(),
    })
}

async fn assert_override(State(state): State<AppState>, Path(ticker): Path<String>) -> Json<BreakerResp> {
    set_override(&state, ticker, true)
}

async fn clear_override(State(state): State<AppState>, Path(ticker): Path<String>) -> Json<BreakerResp> {
    set_override(&state, ticker, false)
}

fn set_override(state: &AppState, ticker: String, asserted: bool) -> Json<BreakerResp> {
    let ticker = ticker.to_ascii_uppercase();
    let transitions = state.pipeline.set_override(&ticker, asserted);
    let phase = state.pipeline.breaker_phase(&ticker);
    Json(BreakerResp {
        ticker,
        phase,
        transitions,
    })
}
