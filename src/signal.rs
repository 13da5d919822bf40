//! # Signal Generator
//! Turns a consensus into a directional trade signal.
//!
//! Policy, in order:
//! 1. score above `threshold_bull` → bullish, below `threshold_bear` → bearish, else hold;
//! 2. low confidence or low engagement forces hold;
//! 3. the momentum of the ticker's recent consensus must agree, else hold;
//! 4. a repeat of the previous non-hold direction inside `signal_cooldown` is
//!    suppressed to hold.
//!
//! Strength only sizes the trade downstream; it never gates.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::AggregatedSentiment;
use crate::config::bounded_secs;
use crate::rolling::{linear_slope, SentimentHistory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Bullish,
    Bearish,
    Hold,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Bullish => "bullish",
            Direction::Bearish => "bearish",
            Direction::Hold => "hold",
        }
    }
}

/// Why a signal ended up with its direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    SentimentBullish,
    SentimentBearish,
    Neutral,
    LowConfidence,
    LowVolume,
    MomentumMismatch,
    InsufficientHistory,
    Cooldown,
    CircuitBreaker,
}

impl SignalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalReason::SentimentBullish => "sentiment_bullish",
            SignalReason::SentimentBearish => "sentiment_bearish",
            SignalReason::Neutral => "neutral",
            SignalReason::LowConfidence => "low_confidence",
            SignalReason::LowVolume => "low_volume",
            SignalReason::MomentumMismatch => "momentum_mismatch",
            SignalReason::InsufficientHistory => "insufficient_history",
            SignalReason::Cooldown => "cooldown",
            SignalReason::CircuitBreaker => "circuit_breaker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub id: Uuid,
    pub ticker: String,
    pub direction: Direction,
    /// `[0, 1]`; zero for hold.
    pub strength: f64,
    pub reason: SignalReason,
    pub score: f64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub momentum: Option<f64>,
    pub source_sentiment: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl TradeSignal {
    pub fn is_actionable(&self) -> bool {
        self.direction != Direction::Hold
    }
}

/// How momentum confirms a candidate direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentumRule {
    /// Least-squares slope over the window must point the same way.
    Slope,
    /// The last `momentum_min_points` scores must all share the candidate's sign.
    SignAgreement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub threshold_bull: f64,
    pub threshold_bear: f64,
    pub min_confidence: f64,
    pub volume_floor: f64,
    /// K: rolling window length per ticker.
    pub window_size: usize,
    /// Optional time horizon for the rolling window.
    pub window_horizon_secs: Option<u64>,
    pub signal_cooldown_secs: u64,
    pub momentum: MomentumRule,
    pub momentum_min_points: usize,
    /// Slope magnitude treated as full momentum when computing strength.
    pub momentum_full_scale: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            threshold_bull: 0.6,
            threshold_bear: -0.6,
            min_confidence: 0.7,
            volume_floor: 0.0,
            window_size: 5,
            window_horizon_secs: None,
            signal_cooldown_secs: 300,
            momentum: MomentumRule::Slope,
            momentum_min_points: 2,
            momentum_full_scale: 0.1,
        }
    }
}

/// Same-direction repeat suppression. Opposite direction always passes.
#[derive(Debug, Clone)]
pub struct SignalCooldown {
    cooldown: Duration,
    last_at: Option<DateTime<Utc>>,
    last_direction: Option<Direction>,
}

impl SignalCooldown {
    /// Negative cooldowns are treated as zero.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown: cooldown.max(Duration::zero()),
            last_at: None,
            last_direction: None,
        }
    }

    /// Does NOT mutate state.
    pub fn suppresses(&self, direction: Direction, now: DateTime<Utc>) -> bool {
        match (self.last_at, self.last_direction) {
            (Some(at), Some(last)) => last == direction && now - at < self.cooldown,
            _ => false,
        }
    }

    pub fn record(&mut self, direction: Direction, now: DateTime<Utc>) {
        self.last_at = Some(now);
        self.last_direction = Some(direction);
    }
}

/// Per-ticker mutable state owned by the signal stage.
#[derive(Debug, Clone)]
pub struct SignalState {
    pub history: SentimentHistory,
    pub cooldown: SignalCooldown,
}

impl SignalState {
    pub fn new(cfg: &SignalConfig) -> Self {
        Self {
            history: SentimentHistory::new(
                cfg.window_size,
                cfg.window_horizon_secs.map(bounded_secs),
            ),
            cooldown: SignalCooldown::new(bounded_secs(cfg.signal_cooldown_secs)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalGenerator {
    cfg: SignalConfig,
}

impl SignalGenerator {
    pub fn new(cfg: SignalConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.cfg
    }

    pub fn new_state(&self) -> SignalState {
        SignalState::new(&self.cfg)
    }

    /// Record `agg` into the ticker's history and derive the signal.
    /// `engagement` is that of the item behind `agg`.
    pub fn generate(
        &self,
        agg: &AggregatedSentiment,
        engagement: f64,
        state: &mut SignalState,
    ) -> TradeSignal {
        state.history.record(agg);
        let scores = state.history.scores();
        let slope = linear_slope(&scores);

        let (direction, reason) = self.decide(agg, engagement, &scores, slope);
        let (direction, reason) =
            if direction != Direction::Hold && state.cooldown.suppresses(direction, agg.window_ts) {
                (Direction::Hold, SignalReason::Cooldown)
            } else {
                (direction, reason)
            };
        if direction != Direction::Hold {
            state.cooldown.record(direction, agg.window_ts);
        }

        let strength = if direction == Direction::Hold {
            0.0
        } else {
            self.strength(agg, slope)
        };

        TradeSignal {
            id: Uuid::new_v4(),
            ticker: agg.ticker.clone(),
            direction,
            strength,
            reason,
            score: agg.score,
            confidence: agg.confidence,
            momentum: slope,
            source_sentiment: agg.id,
            timestamp: agg.window_ts,
        }
    }

    fn decide(
        &self,
        agg: &AggregatedSentiment,
        engagement: f64,
        scores: &[f64],
        slope: Option<f64>,
    ) -> (Direction, SignalReason) {
        let candidate = if agg.inconclusive {
            return (Direction::Hold, SignalReason::Neutral);
        } else if agg.score > self.cfg.threshold_bull {
            Direction::Bullish
        } else if agg.score < self.cfg.threshold_bear {
            Direction::Bearish
        } else {
            return (Direction::Hold, SignalReason::Neutral);
        };

        if agg.confidence < self.cfg.min_confidence {
            return (Direction::Hold, SignalReason::LowConfidence);
        }
        if engagement < self.cfg.volume_floor {
            return (Direction::Hold, SignalReason::LowVolume);
        }
        if scores.len() < self.cfg.momentum_min_points {
            return (Direction::Hold, SignalReason::InsufficientHistory);
        }
        if !self.momentum_agrees(candidate, scores, slope) {
            return (Direction::Hold, SignalReason::MomentumMismatch);
        }

        match candidate {
            Direction::Bullish => (candidate, SignalReason::SentimentBullish),
            _ => (candidate, SignalReason::SentimentBearish),
        }
    }

    fn momentum_agrees(&self, candidate: Direction, scores: &[f64], slope: Option<f64>) -> bool {
        match self.cfg.momentum {
            MomentumRule::Slope => match (candidate, slope) {
                // A single point has no trend to contradict.
                (_, None) => true,
                (Direction::Bullish, Some(s)) => s > 0.0,
                (Direction::Bearish, Some(s)) => s < 0.0,
                (Direction::Hold, _) => false,
            },
            MomentumRule::SignAgreement => {
                let n = self.cfg.momentum_min_points.max(1);
                let tail = &scores[scores.len().saturating_sub(n)..];
                match candidate {
                    Direction::Bullish => tail.iter().all(|s| *s > 0.0),
                    Direction::Bearish => tail.iter().all(|s| *s < 0.0),
                    Direction::Hold => false,
                }
            }
        }
    }

    /// Monotonic in |score|, confidence and momentum magnitude.
    fn strength(&self, agg: &AggregatedSentiment, slope: Option<f64>) -> f64 {
        let momentum = slope
            .map(|s| (s.abs() / self.cfg.momentum_full_scale).min(1.0))
            .unwrap_or(0.0);
        (agg.score.abs() * agg.confidence * (0.5 + 0.5 * momentum)).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn agg(score: f64, confidence: f64, at: DateTime<Utc>) -> AggregatedSentiment {
        AggregatedSentiment {
            id: Uuid::new_v4(),
            ticker: "SPY".into(),
            window_ts: at,
            score,
            confidence,
            disagreement: false,
            disagreement_metric: 0.0,
            contributing_models: vec!["lexicon".into()],
            inconclusive: false,
        }
    }

    fn generator() -> SignalGenerator {
        SignalGenerator::new(SignalConfig {
            signal_cooldown_secs: 60,
            ..SignalConfig::default()
        })
    }

    #[test]
    fn rising_bullish_consensus_fires() {
        let g = generator();
        let mut st = g.new_state();
        let first = g.generate(&agg(0.5, 0.9, t(0)), 10.0, &mut st);
        assert_eq!(first.direction, Direction::Hold);
        assert_eq!(first.reason, SignalReason::Neutral);

        let second = g.generate(&agg(0.8, 0.9, t(1)), 10.0, &mut st);
        assert_eq!(second.direction, Direction::Bullish);
        assert_eq!(second.reason, SignalReason::SentimentBullish);
        assert!(second.strength > 0.0 && second.strength <= 1.0);
    }

    #[test]
    fn low_confidence_forces_hold() {
        let g = generator();
        let mut st = g.new_state();
        g.generate(&agg(0.5, 0.9, t(0)), 10.0, &mut st);
        let s = g.generate(&agg(0.9, 0.5, t(1)), 10.0, &mut st);
        assert_eq!(s.direction, Direction::Hold);
        assert_eq!(s.reason, SignalReason::LowConfidence);
        assert_eq!(s.strength, 0.0);
    }

    #[test]
    fn volume_floor_forces_hold() {
        let g = SignalGenerator::new(SignalConfig {
            volume_floor: 100.0,
            ..SignalConfig::default()
        });
        let mut st = g.new_state();
        g.generate(&agg(0.5, 0.9, t(0)), 500.0, &mut st);
        let s = g.generate(&agg(0.9, 0.9, t(1)), 5.0, &mut st);
        assert_eq!(s.reason, SignalReason::LowVolume);
    }

    #[test]
    fn first_point_lacks_history() {
        let g = generator();
        let mut st = g.new_state();
        let s = g.generate(&agg(0.9, 0.9, t(0)), 10.0, &mut st);
        assert_eq!(s.direction, Direction::Hold);
        assert_eq!(s.reason, SignalReason::InsufficientHistory);
    }

    #[test]
    fn fading_momentum_downgrades_to_hold() {
        let g = generator();
        let mut st = g.new_state();
        g.generate(&agg(0.95, 0.9, t(0)), 10.0, &mut st);
        let s = g.generate(&agg(0.7, 0.9, t(1)), 10.0, &mut st);
        assert_eq!(s.direction, Direction::Hold);
        assert_eq!(s.reason, SignalReason::MomentumMismatch);
    }

    #[test]
    fn sign_agreement_rule() {
        let g = SignalGenerator::new(SignalConfig {
            momentum: MomentumRule::SignAgreement,
            momentum_min_points: 2,
            ..SignalConfig::default()
        });
        let mut st = g.new_state();
        g.generate(&agg(-0.1, 0.9, t(0)), 10.0, &mut st);
        let s = g.generate(&agg(-0.8, 0.9, t(1)), 10.0, &mut st);
        assert_eq!(s.direction, Direction::Bearish);

        let mut st = g.new_state();
        g.generate(&agg(0.1, 0.9, t(0)), 10.0, &mut st);
        let s = g.generate(&agg(-0.8, 0.9, t(1)), 10.0, &mut st);
        assert_eq!(s.reason, SignalReason::MomentumMismatch);
    }

    #[test]
    fn same_direction_within_cooldown_is_suppressed() {
        let g = generator();
        let mut st = g.new_state();
        g.generate(&agg(0.5, 0.9, t(0)), 10.0, &mut st);
        let a = g.generate(&agg(0.7, 0.9, t(1)), 10.0, &mut st);
        assert_eq!(a.direction, Direction::Bullish);

        let b = g.generate(&agg(0.9, 0.9, t(10)), 10.0, &mut st);
        assert_eq!(b.direction, Direction::Hold);
        assert_eq!(b.reason, SignalReason::Cooldown);

        // Cooldown counts from the last non-hold signal.
        let c = g.generate(&agg(0.95, 0.9, t(62)), 10.0, &mut st);
        assert_eq!(c.direction, Direction::Bullish);
    }

    #[test]
    fn strength_grows_with_score_and_confidence() {
        let g = generator();
        let weak = g.strength(&agg(0.65, 0.75, t(0)), Some(0.05));
        let strong = g.strength(&agg(0.9, 0.95, t(0)), Some(0.05));
        let steeper = g.strength(&agg(0.9, 0.95, t(0)), Some(0.2));
        assert!(weak < strong);
        assert!(strong < steeper);
    }
}
