//! Boundary to the order-placement side. The core only emits `TradeIntent`s
//! and consumes `ExecutionOutcome`s; how orders reach a broker is up to the
//! `ExecutionDispatcher` implementation plugged in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signal::{Direction, TradeSignal};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Size of a full-strength intent; actual size scales with signal strength.
    pub max_position_size: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_position_size: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: Uuid,
    pub ticker: String,
    pub direction: Direction,
    pub size: f64,
    /// Past this instant the intent is stale and must not be acted on.
    pub deadline: DateTime<Utc>,
    pub signal_id: Uuid,
    /// Single trial trade while the breaker is HALF_OPEN.
    pub probe: bool,
}

impl TradeIntent {
    pub fn from_signal(
        signal: &TradeSignal,
        max_position_size: f64,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticker: signal.ticker.clone(),
            direction: signal.direction,
            size: (max_position_size * signal.strength).max(0.0),
            deadline,
            signal_id: signal.id,
            probe: false,
        }
    }
}

/// What the dispatcher reports back, immediately or later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Filled,
    Rejected { reason: String },
    /// Position closed with realized `pnl`.
    Closed { pnl: f64 },
}

impl ExecutionOutcome {
    /// Whether a HALF_OPEN probe ending this way counts as a success.
    pub fn is_success(&self) -> bool {
        match self {
            ExecutionOutcome::Filled => true,
            ExecutionOutcome::Rejected { .. } => false,
            ExecutionOutcome::Closed { pnl } => *pnl >= 0.0,
        }
    }
}

#[async_trait]
pub trait ExecutionDispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hand off `intent`; the returned outcome is the immediate ack.
    async fn dispatch(&self, intent: &TradeIntent) -> anyhow::Result<ExecutionOutcome>;
}

/// Paper trading: every intent is logged and acknowledged as filled.
/// Only the most recent `cap` intents are kept in memory; the recorder is
/// the durable log.
#[derive(Debug)]
pub struct PaperDispatcher {
    recent: Mutex<VecDeque<TradeIntent>>,
    cap: usize,
    total: AtomicU64,
}

impl Default for PaperDispatcher {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl PaperDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.clamp(1, 10_000);
        Self {
            recent: Mutex::new(VecDeque::with_capacity(cap)),
            cap,
            total: AtomicU64::new(0),
        }
    }

    /// Most recent intents, oldest first.
    pub fn dispatched(&self) -> Vec<TradeIntent> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Intents filled since startup, including ones no longer retained.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ExecutionDispatcher for PaperDispatcher {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn dispatch(&self, intent: &TradeIntent) -> anyhow::Result<ExecutionOutcome> {
        tracing::info!(
            target: "execution",
            intent = %intent.id,
            ticker = %intent.ticker,
            direction = intent.direction.as_str(),
            size = intent.size,
            probe = intent.probe,
            "paper fill"
        );
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == self.cap {
            recent.pop_front();
        }
        recent.push_back(intent.clone());
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(ExecutionOutcome::Filled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_wire_shape() {
        let v = serde_json::to_value(ExecutionOutcome::Closed { pnl: -12.5 }).unwrap();
        assert_eq!(v["status"], "closed");
        assert_eq!(v["pnl"], -12.5);
        let r: ExecutionOutcome =
            serde_json::from_str(r#"{"status":"rejected","reason":"halted"}"#).unwrap();
        assert!(!r.is_success());
    }

    #[test]
    fn probe_success_rules() {
        assert!(ExecutionOutcome::Filled.is_success());
        assert!(ExecutionOutcome::Closed { pnl: 0.0 }.is_success());
        assert!(!ExecutionOutcome::Closed { pnl: -0.01 }.is_success());
    }

    #[tokio::test]
    async fn paper_fills_keep_a_bounded_tail() {
        let paper = PaperDispatcher::with_capacity(4);
        let mut ids = Vec::new();
        for i in 0..10 {
            let intent = TradeIntent {
                id: Uuid::new_v4(),
                ticker: format!("T{i}"),
                direction: Direction::Bullish,
                size: 1.0,
                deadline: Utc::now(),
                signal_id: Uuid::new_v4(),
                probe: false,
            };
            ids.push(intent.id);
            assert_eq!(paper.dispatch(&intent).await.unwrap(), ExecutionOutcome::Filled);
        }
        let kept: Vec<Uuid> = paper.dispatched().iter().map(|i| i.id).collect();
        assert_eq!(kept, ids[6..].to_vec());
        assert_eq!(paper.total(), 10);
    }
}
