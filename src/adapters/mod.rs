// src/adapters/mod.rs
//! Model adapter interface: every scoring backend looks the same to the
//! fan-out, whatever it runs on.

pub mod http;
pub mod lexicon;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ModelConfig, ModelKind};
use crate::error::AdapterError;

/// What a backend returns before the fan-out stamps latency and status on it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawScore {
    /// In `[-1, 1]`.
    pub sentiment: f64,
    /// In `[0, 1]`.
    pub confidence: f64,
}

impl RawScore {
    /// Reject NaN and out-of-range outputs instead of letting them skew the
    /// consensus.
    pub fn validated(self) -> Result<Self, AdapterError> {
        let ok = self.sentiment.is_finite()
            && self.confidence.is_finite()
            && (-1.0..=1.0).contains(&self.sentiment)
            && (0.0..=1.0).contains(&self.confidence);
        if ok {
            Ok(self)
        } else {
            Err(AdapterError::InvalidOutput {
                sentiment: self.sentiment,
                confidence: self.confidence,
            })
        }
    }
}

/// Uniform capability wrapping one scoring backend.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Stable id; must match a configured weight.
    fn id(&self) -> &str;

    /// The adapter's own default timeout. The fan-out caps it by the stage
    /// deadline.
    fn timeout(&self) -> Duration;

    /// Score `text` for `ticker`, giving up after `deadline`.
    async fn score(
        &self,
        text: &str,
        ticker: &str,
        deadline: Duration,
    ) -> Result<RawScore, AdapterError>;
}

pub type DynAdapter = Arc<dyn ModelAdapter>;

/// Build one adapter per configured model, in config order.
pub fn build_adapters(models: &[ModelConfig]) -> anyhow::Result<Vec<DynAdapter>> {
    let mut out: Vec<DynAdapter> = Vec::with_capacity(models.len());
    for m in models {
        let timeout = Duration::from_millis(m.timeout_ms);
        let adapter: DynAdapter = match m.kind {
            ModelKind::Lexicon => Arc::new(lexicon::LexiconAdapter::new(&m.id, timeout)),
            ModelKind::Http => {
                let endpoint = m
                    .endpoint
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("model `{}` has no endpoint", m.id))?;
                Arc::new(http::HttpAdapter::new(&m.id, endpoint, timeout)?)
            }
        };
        out.push(adapter);
    }
    Ok(out)
}
