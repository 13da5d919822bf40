//! # Aggregator
//! Confidence-weighted consensus over the models that actually answered.
//!
//! Only `ok` scores participate. Their configured weights are renormalized so
//! that the participating weights always sum to 1. Strong disagreement
//! (max pairwise spread above the threshold) scales confidence down by
//! `1 - spread`, floored at zero. No participating model means an
//! inconclusive result, never an error.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ensemble::ModelScore;

/// Read-only model weights, validated at startup to sum to 1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelWeights(HashMap<String, f64>);

impl ModelWeights {
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Unknown models weigh nothing.
    pub fn weight_for(&self, model_id: &str) -> f64 {
        self.0.get(model_id).copied().unwrap_or(0.0)
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }
}

/// Consensus for one ticker from one content item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedSentiment {
    pub id: Uuid,
    pub ticker: String,
    pub window_ts: DateTime<Utc>,
    pub score: f64,
    pub confidence: f64,
    pub disagreement: bool,
    /// Max pairwise absolute difference among participating scores.
    pub disagreement_metric: f64,
    pub contributing_models: Vec<String>,
    pub inconclusive: bool,
}

impl AggregatedSentiment {
    pub fn inconclusive(ticker: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: ticker.into(),
            window_ts: at,
            score: 0.0,
            confidence: 0.0,
            disagreement: false,
            disagreement_metric: 0.0,
            contributing_models: Vec::new(),
            inconclusive: true,
        }
    }
}

/// Effective weights of the participating (`ok`, positively weighted) models.
/// Empty when nobody can contribute.
pub fn renormalize<'a>(scores: &'a [ModelScore], weights: &ModelWeights) -> Vec<(&'a ModelScore, f64)> {
    let participating: Vec<(&ModelScore, f64)> = scores
        .iter()
        .filter(|s| s.is_ok())
        .map(|s| (s, weights.weight_for(&s.model_id)))
        .filter(|(_, w)| *w > 0.0)
        .collect();
    let sum: f64 = participating.iter().map(|(_, w)| w).sum();
    if sum <= 0.0 {
        return Vec::new();
    }
    participating
        .into_iter()
        .map(|(s, w)| (s, w / sum))
        .collect()
}

/// Max pairwise absolute difference, i.e. `max - min`.
pub fn max_pairwise_spread<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for v in values {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if hi >= lo {
        hi - lo
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    weights: ModelWeights,
    disagreement_threshold: f64,
}

impl Aggregator {
    pub fn new(weights: ModelWeights, disagreement_threshold: f64) -> Self {
        Self {
            weights,
            disagreement_threshold,
        }
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    pub fn aggregate(
        &self,
        ticker: &str,
        scores: &[ModelScore],
        at: DateTime<Utc>,
    ) -> AggregatedSentiment {
        let effective = renormalize(scores, &self.weights);
        if effective.is_empty() {
            return AggregatedSentiment::inconclusive(ticker, at);
        }

        let score: f64 = effective.iter().map(|(s, w)| w * s.sentiment).sum();
        let mut confidence: f64 = effective.iter().map(|(s, w)| w * s.confidence).sum();

        let spread = max_pairwise_spread(effective.iter().map(|(s, _)| s.sentiment));
        let disagreement = spread > self.disagreement_threshold;
        if disagreement {
            confidence *= (1.0 - spread).max(0.0);
        }

        AggregatedSentiment {
            id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            window_ts: at,
            score: score.clamp(-1.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            disagreement,
            disagreement_metric: spread,
            contributing_models: effective.iter().map(|(s, _)| s.model_id.clone()).collect(),
            inconclusive: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RawScore;
    use crate::error::AdapterError;
    use std::time::Duration;

    fn ok(id: &str, sentiment: f64, confidence: f64) -> ModelScore {
        ModelScore::ok(
            id,
            RawScore {
                sentiment,
                confidence,
            },
            Duration::from_millis(5),
        )
    }

    fn timed_out(id: &str) -> ModelScore {
        ModelScore::failed(id, &AdapterError::Timeout, Duration::from_millis(100))
    }

    fn three_models() -> ModelWeights {
        ModelWeights::new([("finbert", 0.30), ("llama", 0.35), ("claude", 0.35)])
    }

    #[test]
    fn weighted_score_all_present() {
        let agg = Aggregator::new(three_models(), 0.5);
        let scores = vec![ok("finbert", 0.8, 1.0), ok("llama", 0.6, 1.0), ok("claude", 0.7, 1.0)];
        let out = agg.aggregate("SPY", &scores, Utc::now());
        assert!((out.score - 0.695).abs() < 1e-9, "got {}", out.score);
        assert!(!out.inconclusive);
        assert_eq!(out.contributing_models.len(), 3);
    }

    #[test]
    fn missing_model_renormalizes_remaining_weights() {
        let scores = vec![timed_out("finbert"), ok("llama", 0.6, 0.9), ok("claude", 0.7, 0.9)];
        let eff = renormalize(&scores, &three_models());
        assert_eq!(eff.len(), 2);
        for (_, w) in &eff {
            assert!((w - 0.5).abs() < 1e-12);
        }

        let agg = Aggregator::new(three_models(), 0.5);
        let out = agg.aggregate("SPY", &scores, Utc::now());
        assert!((out.score - 0.65).abs() < 1e-9);
        assert_eq!(out.contributing_models, vec!["llama", "claude"]);
    }

    #[test]
    fn renormalized_weights_sum_to_one_for_every_subset() {
        let weights = three_models();
        let ids = ["finbert", "llama", "claude"];
        for mask in 1u8..8 {
            let scores: Vec<ModelScore> = ids
                .iter()
                .enumerate()
                .map(|(i, id)| {
                    if mask & (1 << i) != 0 {
                        ok(id, 0.1, 0.5)
                    } else {
                        timed_out(id)
                    }
                })
                .collect();
            let total: f64 = renormalize(&scores, &weights).iter().map(|(_, w)| w).sum();
            assert!((total - 1.0).abs() < 1e-9, "mask {mask:03b} -> {total}");
        }
    }

    #[test]
    fn no_ok_model_is_inconclusive() {
        let agg = Aggregator::new(three_models(), 0.5);
        let scores = vec![
            timed_out("finbert"),
            ModelScore::failed("llama", &AdapterError::Failed("boom".into()), Duration::ZERO),
        ];
        let out = agg.aggregate("SPY", &scores, Utc::now());
        assert!(out.inconclusive);
        assert_eq!(out.score, 0.0);
        assert_eq!(out.confidence, 0.0);
        assert!(!out.disagreement);

        let empty = agg.aggregate("SPY", &[], Utc::now());
        assert!(empty.inconclusive);
    }

    #[test]
    fn disagreement_scales_confidence() {
        let weights = ModelWeights::new([("a", 0.5), ("b", 0.5)]);
        let agg = Aggregator::new(weights, 0.3);
        let out = agg.aggregate("SPY", &[ok("a", 0.6, 1.0), ok("b", 0.2, 1.0)], Utc::now());
        assert!(out.disagreement);
        assert!((out.disagreement_metric - 0.4).abs() < 1e-9);
        assert!((out.confidence - 0.6).abs() < 1e-9);

        let wild = agg.aggregate("SPY", &[ok("a", 0.9, 1.0), ok("b", -0.9, 1.0)], Utc::now());
        assert_eq!(wild.confidence, 0.0);
    }

    #[test]
    fn confidence_never_increases_with_spread() {
        let weights = ModelWeights::new([("a", 0.5), ("b", 0.5)]);
        let agg = Aggregator::new(weights, 0.2);
        let mut prev = f64::INFINITY;
        for step in 0..=20 {
            let half = step as f64 * 0.05;
            let out = agg.aggregate(
                "SPY",
                &[ok("a", half, 0.8), ok("b", -half, 0.8)],
                Utc::now(),
            );
            assert!(out.confidence <= prev + 1e-12, "step {step}");
            prev = out.confidence;
        }
    }
}
