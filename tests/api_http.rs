// tests/api_http.rs
mod common;

use axum::body::{self, Body};
use http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{pipeline_with, test_config};
use sentiment_gate::api::{create_router, AppState};

fn app() -> Router {
    let (pipeline, _paper) = pipeline_with(test_config());
    create_router(AppState { pipeline })
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    // axum::body::to_bytes requires an explicit limit
    let bytes = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let v = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, v)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_ok() {
    let resp = app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn intake_accepts_and_returns_id() {
    let app = app();
    let (status, v) = send(
        &app,
        post_json("/intake", json!({"ticker": "spy", "text": "0.2", "source": "test"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(v["item_id"].as_str().is_some());
}

#[tokio::test]
async fn intake_wait_returns_report() {
    let app = app();
    let (status, v) = send(
        &app,
        post_json(
            "/intake?wait=true",
            json!({"tickers": ["aapl"], "headline": "0.8", "source": "test"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let outcome = &v["outcomes"][0];
    assert_eq!(outcome["kind"], "dispatched");
    assert_eq!(outcome["intent"]["ticker"], "AAPL");

    let (status, state) = send(&app, Request::get("/state").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(state["tickers"][0]["ticker"], "AAPL");
    assert_eq!(state["tickers"][0]["signal"]["direction"], "bullish");
    assert_eq!(state["breakers"]["AAPL"]["phase"], "CLOSED");
}

#[tokio::test]
async fn intake_without_text_or_ticker_is_unprocessable() {
    let app = app();
    let (status, _) = send(&app, post_json("/intake", json!({"ticker": "SPY", "text": "   "}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    let (status, v) = send(&app, post_json("/intake", json!({"text": "0.9"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(v["error"].as_str().is_some());
}

#[tokio::test]
async fn override_round_trip() {
    let app = app();
    let (status, v) = send(
        &app,
        Request::post("/breaker/tsla/override").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["ticker"], "TSLA");
    assert_eq!(v["phase"], "OPEN");
    assert_eq!(v["transitions"][0]["reason"], "manual_override");

    let (_, v) = send(&app, Request::get("/breaker/TSLA").body(Body::empty()).unwrap()).await;
    assert_eq!(v["phase"], "OPEN");

    let (status, v) = send(
        &app,
        Request::delete("/breaker/TSLA/override").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["phase"], "CLOSED");
}

#[tokio::test]
async fn reported_outcome_feeds_breaker() {
    let app = app();
    let body = json!({
        "ticker": "SPY",
        "intent_id": uuid::Uuid::new_v4(),
        "outcome": {"status": "closed", "pnl": -600.0}
    });
    let (status, v) = send(&app, post_json("/outcome", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["phase"], "OPEN");
    assert_eq!(v["transitions"][0]["reason"], "drawdown");
}
