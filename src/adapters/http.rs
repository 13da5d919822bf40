//! Remote scoring backend reached over HTTP (FinBERT server, LLM gateway, ...).
//!
//! Request:  `POST {endpoint}` with `{"model": id, "ticker": "SPY", "text": "..."}`
//! Response: `{"sentiment": -1..1, "confidence": 0..1}`

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ModelAdapter, RawScore};
use crate::error::AdapterError;

pub struct HttpAdapter {
    id: String,
    endpoint: String,
    timeout: Duration,
    http: reqwest::Client,
    api_key: Option<String>,
}

impl HttpAdapter {
    /// The bearer token, if any, is read from `SCORER_<ID>_API_KEY`.
    pub fn new(id: &str, endpoint: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent("sentiment-gate/0.1")
            .connect_timeout(timeout)
            .build()
            .context("building scorer http client")?;
        let key_var = format!(
            "SCORER_{}_API_KEY",
            id.to_ascii_uppercase().replace(['-', '.'], "_")
        );
        Ok(Self {
            id: id.to_string(),
            endpoint,
            timeout,
            http,
            api_key: std::env::var(key_var).ok().filter(|k| !k.is_empty()),
        })
    }
}

#[derive(Serialize)]
struct ScoreReq<'a> {
    model: &'a str,
    ticker: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ScoreResp {
    sentiment: f64,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

#[async_trait]
impl ModelAdapter for HttpAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn score(
        &self,
        text: &str,
        ticker: &str,
        deadline: Duration,
    ) -> Result<RawScore, AdapterError> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .timeout(deadline)
            .json(&ScoreReq {
                model: &self.id,
                ticker,
                text,
            });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout
            } else {
                AdapterError::Failed(format!("request: {e}"))
            }
        })?;
        let resp = resp
            .error_for_status()
            .map_err(|e| AdapterError::Failed(format!("status: {e}")))?;
        let body: ScoreResp = resp
            .json()
            .await
            .map_err(|e| AdapterError::Failed(format!("decode: {e}")))?;

        RawScore {
            sentiment: body.sentiment,
            confidence: body.confidence,
        }
        .validated()
    }
}
