//! Outbound alerts when a circuit breaker trips.
//!
//! Alerts ride on the event bus: `spawn_breaker_alerts` subscribes, filters
//! transitions into OPEN and fans them out to every configured webhook,
//! behind a per-breaker anti-flutter gate. Nothing here can slow the core.

pub mod antiflutter;
pub mod discord;
pub mod slack;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::breaker::{Phase, Transition, TripReason};
use crate::events::PipelineEvent;

pub use antiflutter::AntiFlutter;
pub use discord::DiscordNotifier;
pub use slack::SlackNotifier;

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerAlert {
    /// Ticker, or `*` for the global breaker.
    pub key: String,
    pub from: Phase,
    pub to: Phase,
    pub reason: Option<TripReason>,
    pub at: DateTime<Utc>,
}

impl BreakerAlert {
    /// Alert for transitions worth waking someone for: trips into OPEN.
    pub fn from_transition(t: &Transition) -> Option<Self> {
        (t.to == Phase::Open).then(|| Self {
            key: t.key.clone(),
            from: t.from,
            to: t.to,
            reason: t.reason,
            at: t.at,
        })
    }

    pub fn reason_str(&self) -> &'static str {
        match self.reason {
            Some(TripReason::MaxDailyTrades) => "max daily trades reached",
            Some(TripReason::Drawdown) => "drawdown limit exceeded",
            Some(TripReason::ConsecutiveLosses) => "consecutive loss limit exceeded",
            Some(TripReason::ManualOverride) => "manual override",
            Some(TripReason::ProbeFailed) => "half-open probe failed",
            None => "unspecified",
        }
    }

    pub fn title(&self) -> String {
        format!("Circuit breaker {} -> {}: {}", self.from.as_str(), self.to.as_str(), self.key)
    }
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, alert: &BreakerAlert) -> Result<()>;
}

/// Every configured notifier. Empty when no webhook is set.
#[derive(Default)]
pub struct NotifierMux {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotifierMux {
    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Slack via `SLACK_WEBHOOK_URL`, Discord via `DISCORD_WEBHOOK_URL`.
    pub fn from_env() -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
        if let Some(url) = env_url("SLACK_WEBHOOK_URL") {
            notifiers.push(Box::new(SlackNotifier::new(url)));
        }
        if let Some(url) = env_url("DISCORD_WEBHOOK_URL") {
            notifiers.push(Box::new(DiscordNotifier::new(url)));
        }
        Self { notifiers }
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    /// Send to all; failures are logged per notifier. Returns how many succeeded.
    pub async fn send_all(&self, alert: &BreakerAlert) -> usize {
        let mut ok = 0;
        for n in &self.notifiers {
            match n.send(alert).await {
                Ok(()) => ok += 1,
                Err(e) => {
                    tracing::warn!(target: "breaker", notifier = n.name(), key = %alert.key, error = %e, "alert delivery failed")
                }
            }
        }
        ok
    }
}

fn env_url(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Forward breaker trips from `events` to `mux` until the bus closes.
pub fn spawn_breaker_alerts(
    mux: NotifierMux,
    mut events: broadcast::Receiver<PipelineEvent>,
    cooldown_secs: i64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut gate = AntiFlutter::new(cooldown_secs);
        loop {
            let ev = match events.recv().await {
                Ok(ev) => ev,
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(target: "breaker", skipped = n, "alert subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let PipelineEvent::CircuitBreakerStateChanged { transition } = ev else {
                continue;
            };
            let Some(alert) = BreakerAlert::from_transition(&transition) else {
                continue;
            };
            if !gate.should_alert(&alert.key, alert.at) {
                tracing::debug!(target: "breaker", key = %alert.key, "alert suppressed by cooldown");
                continue;
            }
            if mux.send_all(&alert).await > 0 {
                gate.record_alert(&alert.key, alert.at);
            }
        }
    })
}
