// Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use sentiment_gate::adapters::{DynAdapter, ModelAdapter, RawScore};
use sentiment_gate::config::{ModelConfig, ModelKind, PipelineConfig};
use sentiment_gate::error::AdapterError;
use sentiment_gate::events::NullRecorder;
use sentiment_gate::execution::PaperDispatcher;
use sentiment_gate::{ContentItem, Pipeline};

/// Scores whatever the text (or its own fixed script) tells it to.
///
/// Script format: `<sentiment>[@<delay_ms>]`, or `fail`, or `hang`.
/// Confidence is always 0.9.
pub struct Scripted {
    id: String,
    timeout: Duration,
    script: Option<String>,
}

impl Scripted {
    /// Follows the item text.
    pub fn new(id: &str, timeout_ms: u64) -> DynAdapter {
        Arc::new(Self {
            id: id.into(),
            timeout: Duration::from_millis(timeout_ms),
            script: None,
        })
    }

    /// Ignores the item text and always plays `script`.
    pub fn fixed(id: &str, timeout_ms: u64, script: &str) -> DynAdapter {
        Arc::new(Self {
            id: id.into(),
            timeout: Duration::from_millis(timeout_ms),
            script: Some(script.into()),
        })
    }
}

#[async_trait]
impl ModelAdapter for Scripted {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn score(&self, text: &str, _ticker: &str, _deadline: Duration) -> Result<RawScore, AdapterError> {
        let text = self.script.as_deref().unwrap_or(text);
        match text {
            "fail" => return Err(AdapterError::Failed("scripted failure".into())),
            "hang" => std::future::pending::<()>().await,
            _ => {}
        }
        let (score, delay) = match text.split_once('@') {
            Some((s, d)) => (s, d.parse::<u64>().unwrap_or(0)),
            None => (text, 0),
        };
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let sentiment: f64 = score
            .parse()
            .map_err(|_| AdapterError::Failed(format!("unscripted text {text:?}")))?;
        RawScore {
            sentiment,
            confidence: 0.9,
        }
        .validated()
    }
}

/// One scripted model, weight 1, and a signal stage that fires on the first
/// point without repeat cooldown.
pub fn test_config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.models = vec![ModelConfig {
        id: "scripted".into(),
        weight: 1.0,
        timeout_ms: 100,
        kind: ModelKind::Lexicon,
        endpoint: None,
    }];
    cfg.signal.momentum_min_points = 1;
    cfg.signal.signal_cooldown_secs = 0;
    cfg.validate().unwrap();
    cfg
}

pub fn pipeline_with(cfg: PipelineConfig) -> (Arc<Pipeline>, Arc<PaperDispatcher>) {
    let paper = Arc::new(PaperDispatcher::new());
    let pipeline = Pipeline::new(
        Arc::new(cfg),
        vec![Scripted::new("scripted", 100)],
        paper.clone(),
        Arc::new(NullRecorder),
    );
    (Arc::new(pipeline), paper)
}

pub fn item(tickers: &[&str], text: &str) -> ContentItem {
    ContentItem {
        id: Uuid::new_v4(),
        tickers: tickers.iter().map(|t| t.to_string()).collect(),
        text: text.into(),
        source: "test".into(),
        timestamp: Utc::now(),
        engagement: 10.0,
    }
}
