//! # Risk Circuit Breaker
//! Stateful gate between trade signals and dispatch.
//!
//! ```text
//!   CLOSED --(max trades | drawdown | loss streak | manual)--> OPEN
//!   OPEN   --(cooldown elapsed)--------------------------------> HALF_OPEN
//!   HALF_OPEN --(probe ok)--> CLOSED (counters zeroed, cooldown reset)
//!   HALF_OPEN --(probe failed)--> OPEN (cooldown doubled, capped)
//! ```
//!
//! All transitions for one key happen under that key's mutex, so concurrent
//! evaluations see one consistent phase and OPEN→HALF_OPEN fires once.
//! Trade/loss/PnL counters reset at every period boundary regardless of phase.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::bounded_secs;
use crate::execution::ExecutionOutcome;

/// Key used for every ticker when the breaker is global.
pub const GLOBAL_KEY: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    PerTicker,
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub scope: BreakerScope,
    pub max_daily_trades: u32,
    /// Peak-to-trough realized PnL within the period, in account currency.
    pub drawdown_limit: f64,
    pub consecutive_loss_limit: u32,
    pub initial_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    /// Counter reset period, aligned to the UNIX epoch (86400 = daily, UTC).
    pub period_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            scope: BreakerScope::PerTicker,
            max_daily_trades: 10,
            drawdown_limit: 500.0,
            consecutive_loss_limit: 3,
            initial_cooldown_secs: 300,
            max_cooldown_secs: 3600,
            period_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Closed,
    Open,
    HalfOpen,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Closed => "CLOSED",
            Phase::Open => "OPEN",
            Phase::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    MaxDailyTrades,
    Drawdown,
    ConsecutiveLosses,
    ManualOverride,
    ProbeFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub key: String,
    pub from: Phase,
    pub to: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TripReason>,
    pub at: DateTime<Utc>,
}

/// Result of asking the breaker to let one trade through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { probe: bool },
    Suppressed { phase: Phase },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub phase: Phase,
    pub trip_reason: Option<TripReason>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub cooldown_secs: i64,
    pub trades_in_period: u32,
    pub consecutive_losses: u32,
    pub realized_pnl: f64,
    pub manual_override: bool,
    pub probe_in_flight: bool,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    key: String,
    cfg: BreakerConfig,
    phase: Phase,
    trip_reason: Option<TripReason>,
    cooldown: Duration,
    cooldown_until: Option<DateTime<Utc>>,
    period: i64,
    trades_in_period: u32,
    consecutive_losses: u32,
    realized_pnl: f64,
    peak_pnl: f64,
    probe: Option<Uuid>,
    manual_override: bool,
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, cfg: BreakerConfig, now: DateTime<Utc>) -> Self {
        let cooldown = bounded_secs(cfg.initial_cooldown_secs);
        let period = period_index(now, cfg.period_secs);
        Self {
            key: key.into(),
            cfg,
            phase: Phase::Closed,
            trip_reason: None,
            cooldown,
            cooldown_until: None,
            period,
            trades_in_period: 0,
            consecutive_losses: 0,
            realized_pnl: 0.0,
            peak_pnl: 0.0,
            probe: None,
            manual_override: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Current phase after applying any due period reset or cooldown expiry.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Vec<Transition> {
        let mut out = Vec::new();
        self.roll_period(now);
        if self.phase == Phase::Open && !self.manual_override {
            if let Some(until) = self.cooldown_until {
                if now >= until {
                    out.push(self.transition(Phase::HalfOpen, None, now));
                }
            }
        }
        out
    }

    /// Ask to dispatch intent `intent_id`. In CLOSED this counts the trade;
    /// in HALF_OPEN only the first caller becomes the probe.
    pub fn admit(&mut self, intent_id: Uuid, now: DateTime<Utc>) -> (Admission, Vec<Transition>) {
        let mut transitions = self.refresh(now);
        let admission = match self.phase {
            Phase::Closed => {
                self.trades_in_period = self.trades_in_period.saturating_add(1);
                if self.trades_in_period >= self.cfg.max_daily_trades {
                    transitions.push(self.trip(TripReason::MaxDailyTrades, now));
                }
                Admission::Allowed { probe: false }
            }
            Phase::HalfOpen if self.probe.is_none() => {
                self.probe = Some(intent_id);
                self.trades_in_period = self.trades_in_period.saturating_add(1);
                Admission::Allowed { probe: true }
            }
            phase => Admission::Suppressed { phase },
        };
        (admission, transitions)
    }

    /// Feed back what happened to a dispatched intent.
    pub fn record_outcome(
        &mut self,
        intent_id: Uuid,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Vec<Transition> {
        let mut transitions = self.refresh(now);

        match outcome {
            ExecutionOutcome::Filled => {}
            ExecutionOutcome::Rejected { .. } => {
                self.consecutive_losses = self.consecutive_losses.saturating_add(1);
            }
            ExecutionOutcome::Closed { pnl } => {
                self.realized_pnl += pnl;
                self.peak_pnl = self.peak_pnl.max(self.realized_pnl);
                if *pnl < 0.0 {
                    self.consecutive_losses = self.consecutive_losses.saturating_add(1);
                } else {
                    self.consecutive_losses = 0;
                }
            }
        }

        if self.phase == Phase::HalfOpen && self.probe == Some(intent_id) {
            self.probe = None;
            if outcome.is_success() {
                self.reset_counters();
                self.cooldown = bounded_secs(self.cfg.initial_cooldown_secs);
                self.cooldown_until = None;
                transitions.push(self.transition(Phase::Closed, None, now));
            } else {
                let max = bounded_secs(self.cfg.max_cooldown_secs);
                self.cooldown = (self.cooldown * 2).min(max);
                transitions.push(self.trip(TripReason::ProbeFailed, now));
            }
            return transitions;
        }

        if self.phase == Phase::Closed {
            if self.consecutive_losses > self.cfg.consecutive_loss_limit {
                transitions.push(self.trip(TripReason::ConsecutiveLosses, now));
            } else if self.peak_pnl - self.realized_pnl > self.cfg.drawdown_limit {
                transitions.push(self.trip(TripReason::Drawdown, now));
            }
        }
        transitions
    }

    /// Manual override: force OPEN until cleared.
    pub fn assert_override(&mut self, now: DateTime<Utc>) -> Vec<Transition> {
        self.manual_override = true;
        self.probe = None;
        if self.phase == Phase::Open && self.trip_reason == Some(TripReason::ManualOverride) {
            return Vec::new();
        }
        vec![self.trip(TripReason::ManualOverride, now)]
    }

    /// Lift a manual override: back to CLOSED with counters kept.
    pub fn clear_override(&mut self, now: DateTime<Utc>) -> Vec<Transition> {
        if !self.manual_override {
            return Vec::new();
        }
        self.manual_override = false;
        self.probe = None;
        self.cooldown_until = None;
        if self.phase == Phase::Closed {
            return Vec::new();
        }
        vec![self.transition(Phase::Closed, None, now)]
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            phase: self.phase,
            trip_reason: self.trip_reason,
            cooldown_until: self.cooldown_until,
            cooldown_secs: self.cooldown.num_seconds(),
            trades_in_period: self.trades_in_period,
            consecutive_losses: self.consecutive_losses,
            realized_pnl: self.realized_pnl,
            manual_override: self.manual_override,
            probe_in_flight: self.probe.is_some(),
        }
    }

    fn trip(&mut self, reason: TripReason, now: DateTime<Utc>) -> Transition {
        let until = now
            .checked_add_signed(self.cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.cooldown_until = Some(until);
        tracing::warn!(
            target: "breaker",
            key = %self.key,
            reason = ?reason,
            cooldown_secs = self.cooldown.num_seconds(),
            trades = self.trades_in_period,
            losses = self.consecutive_losses,
            "circuit breaker tripped"
        );
        self.transition(Phase::Open, Some(reason), now)
    }

    fn transition(&mut self, to: Phase, reason: Option<TripReason>, now: DateTime<Utc>) -> Transition {
        let from = self.phase;
        self.phase = to;
        if to == Phase::Closed {
            self.trip_reason = None;
        } else if reason.is_some() {
            self.trip_reason = reason;
        }
        counter!("breaker_transitions_total", "to" => to.as_str()).increment(1);
        tracing::info!(
            target: "breaker",
            key = %self.key,
            from = from.as_str(),
            to = to.as_str(),
            "breaker phase change"
        );
        Transition {
            key: self.key.clone(),
            from,
            to,
            reason,
            at: now,
        }
    }

    fn roll_period(&mut self, now: DateTime<Utc>) {
        let idx = period_index(now, self.cfg.period_secs);
        if idx != self.period {
            self.period = idx;
            self.reset_counters();
            tracing::debug!(target: "breaker", key = %self.key, period = idx, "period rollover");
        }
    }

    fn reset_counters(&mut self) {
        self.trades_in_period = 0;
        self.consecutive_losses = 0;
        self.realized_pnl = 0.0;
        self.peak_pnl = 0.0;
    }
}

fn period_index(now: DateTime<Utc>, period_secs: u64) -> i64 {
    now.timestamp().div_euclid(bounded_secs(period_secs.max(1)).num_seconds())
}

type Slot = Arc<Mutex<CircuitBreaker>>;

/// Owns every breaker. One per ticker, or a single shared one in global scope.
#[derive(Debug)]
pub struct BreakerRegistry {
    cfg: BreakerConfig,
    slots: RwLock<HashMap<String, Slot>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn key_for(&self, ticker: &str) -> String {
        match self.cfg.scope {
            BreakerScope::PerTicker => ticker.to_string(),
            BreakerScope::Global => GLOBAL_KEY.to_string(),
        }
    }

    fn slot(&self, ticker: &str, now: DateTime<Utc>) -> Slot {
        let key = self.key_for(ticker);
        if let Some(s) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Arc::clone(s);
        }
        let mut w = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            w.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(key, self.cfg.clone(), now)))),
        )
    }

    /// Run `f` with exclusive access to the breaker guarding `ticker`.
    pub fn with<R>(
        &self,
        ticker: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut CircuitBreaker) -> R,
    ) -> R {
        let slot = self.slot(ticker, now);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn admit(&self, ticker: &str, intent_id: Uuid, now: DateTime<Utc>) -> (Admission, Vec<Transition>) {
        self.with(ticker, now, |b| b.admit(intent_id, now))
    }

    pub fn record_outcome(
        &self,
        ticker: &str,
        intent_id: Uuid,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Vec<Transition> {
        self.with(ticker, now, |b| b.record_outcome(intent_id, outcome, now))
    }

    pub fn set_override(&self, ticker: &str, asserted: bool, now: DateTime<Utc>) -> Vec<Transition> {
        self.with(ticker, now, |b| {
            if asserted {
                b.assert_override(now)
            } else {
                b.clear_override(now)
            }
        })
    }

    /// Phase of the breaker guarding `ticker` (CLOSED if never touched).
    pub fn phase(&self, ticker: &str, now: DateTime<Utc>) -> Phase {
        self.with(ticker, now, |b| {
            b.refresh(now);
            b.phase()
        })
    }

    pub fn snapshot(&self) -> Vec<(String, BreakerSnapshot)> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut out: Vec<(String, BreakerSnapshot)> = slots
            .into_iter()
            .map(|(k, s)| {
                let snap = s.lock().unwrap_or_else(PoisonError::into_inner).snapshot();
                (k, snap)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        // 2023-11-14 22:13:20 UTC; leaves >1h before the next UTC day.
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn cfg() -> BreakerConfig {
        BreakerConfig {
            max_daily_trades: 3,
            drawdown_limit: 100.0,
            consecutive_loss_limit: 2,
            initial_cooldown_secs: 60,
            max_cooldown_secs: 200,
            ..BreakerConfig::default()
        }
    }

    #[test]
    fn trips_after_max_trades_and_suppresses() {
        let mut b = CircuitBreaker::new("SPY", cfg(), t(0));
        for i in 0..3 {
            let (adm, _) = b.admit(Uuid::new_v4(), t(i));
            assert_eq!(adm, Admission::Allowed { probe: false });
        }
        assert_eq!(b.phase(), Phase::Open);
        let (adm, _) = b.admit(Uuid::new_v4(), t(5));
        assert_eq!(adm, Admission::Suppressed { phase: Phase::Open });
        assert_eq!(b.snapshot().trip_reason, Some(TripReason::MaxDailyTrades));
    }

    #[test]
    fn consecutive_losses_trip() {
        let mut b = CircuitBreaker::new("SPY", cfg(), t(0));
        let id = Uuid::new_v4();
        for i in 0..2 {
            let tr = b.record_outcome(id, &ExecutionOutcome::Closed { pnl: -1.0 }, t(i));
            assert!(tr.is_empty());
        }
        let tr = b.record_outcome(id, &ExecutionOutcome::Rejected { reason: "x".into() }, t(3));
        assert_eq!(tr.len(), 1);
        assert_eq!(tr[0].reason, Some(TripReason::ConsecutiveLosses));
    }

    #[test]
    fn drawdown_is_peak_to_trough() {
        let mut b = CircuitBreaker::new("SPY", cfg(), t(0));
        let id = Uuid::new_v4();
        b.record_outcome(id, &ExecutionOutcome::Closed { pnl: 80.0 }, t(1));
        b.record_outcome(id, &ExecutionOutcome::Closed { pnl: -90.0 }, t(2));
        assert_eq!(b.phase(), Phase::Closed);
        let tr = b.record_outcome(id, &ExecutionOutcome::Closed { pnl: -20.0 }, t(3));
        assert_eq!(tr[0].reason, Some(TripReason::Drawdown));
    }

    #[test]
    fn half_open_allows_a_single_probe() {
        let mut b = CircuitBreaker::new("SPY", cfg(), t(0));
        for i in 0..3 {
            b.admit(Uuid::new_v4(), t(i));
        }
        assert_eq!(b.phase(), Phase::Open);

        let probe = Uuid::new_v4();
        let (adm, tr) = b.admit(probe, t(70));
        assert_eq!(adm, Admission::Allowed { probe: true });
        assert_eq!(tr[0].to, Phase::HalfOpen);

        let (adm, _) = b.admit(Uuid::new_v4(), t(71));
        assert_eq!(adm, Admission::Suppressed { phase: Phase::HalfOpen });
    }

    #[test]
    fn probe_failure_doubles_cooldown_up_to_cap() {
        let mut b = CircuitBreaker::new("SPY", cfg(), t(0));
        for i in 0..3 {
            b.admit(Uuid::new_v4(), t(i));
        }
        let mut now = 2;
        let mut expected = [120, 200, 200].into_iter();
        for _ in 0..3 {
            now += b.cooldown().num_seconds() + 1;
            let probe = Uuid::new_v4();
            let (adm, _) = b.admit(probe, t(now));
            assert_eq!(adm, Admission::Allowed { probe: true });
            let tr = b.record_outcome(probe, &ExecutionOutcome::Rejected { reason: "no fill".into() }, t(now));
            assert_eq!(tr.last().unwrap().reason, Some(TripReason::ProbeFailed));
            assert_eq!(b.phase(), Phase::Open);
            assert_eq!(b.cooldown().num_seconds(), expected.next().unwrap());
        }
    }

    #[test]
    fn probe_success_closes_and_zeroes_counters() {
        let mut b = CircuitBreaker::new("SPY", cfg(), t(0));
        for i in 0..3 {
            b.admit(Uuid::new_v4(), t(i));
        }
        let probe = Uuid::new_v4();
        b.admit(probe, t(100));
        let tr = b.record_outcome(probe, &ExecutionOutcome::Filled, t(101));
        assert_eq!(tr.last().unwrap().to, Phase::Closed);
        let snap = b.snapshot();
        assert_eq!(snap.phase, Phase::Closed);
        assert_eq!(snap.trades_in_period, 0);
        assert_eq!(snap.consecutive_losses, 0);
        assert_eq!(snap.cooldown_secs, 60);
    }

    #[test]
    fn period_boundary_resets_counters_not_phase() {
        let mut b = CircuitBreaker::new("SPY", cfg(), t(0));
        b.admit(Uuid::new_v4(), t(0));
        b.admit(Uuid::new_v4(), t(1));
        assert_eq!(b.snapshot().trades_in_period, 2);

        let next_day = t(86_400);
        b.refresh(next_day);
        assert_eq!(b.snapshot().trades_in_period, 0);
        assert_eq!(b.phase(), Phase::Closed);
    }

    #[test]
    fn manual_override_holds_open_past_cooldown() {
        let mut b = CircuitBreaker::new("SPY", cfg(), t(0));
        b.assert_override(t(0));
        let (adm, _) = b.admit(Uuid::new_v4(), t(10_000));
        assert_eq!(adm, Admission::Suppressed { phase: Phase::Open });
        let tr = b.clear_override(t(10_001));
        assert_eq!(tr[0].to, Phase::Closed);
    }

    #[test]
    fn global_scope_shares_one_breaker() {
        let reg = BreakerRegistry::new(BreakerConfig {
            scope: BreakerScope::Global,
            ..cfg()
        });
        reg.admit("SPY", Uuid::new_v4(), t(0));
        reg.admit("QQQ", Uuid::new_v4(), t(1));
        reg.admit("AAPL", Uuid::new_v4(), t(2));
        assert_eq!(reg.phase("TSLA", t(3)), Phase::Open);
        assert_eq!(reg.snapshot().len(), 1);
        assert_eq!(reg.snapshot()[0].0, GLOBAL_KEY);
    }

    #[test]
    fn oversized_cooldown_saturates() {
        let mut b = CircuitBreaker::new(
            "SPY",
            BreakerConfig {
                initial_cooldown_secs: 10_000_000_000_000,
                max_cooldown_secs: u64::MAX,
                period_secs: u64::MAX,
                ..cfg()
            },
            t(0),
        );
        let tr = b.assert_override(t(0));
        assert_eq!(tr[0].to, Phase::Open);
        assert_eq!(b.cooldown(), bounded_secs(u64::MAX));
        assert!(b.snapshot().cooldown_until.is_some());

        b.clear_override(t(1));
        for i in 0..3 {
            b.admit(Uuid::new_v4(), t(2 + i));
        }
        assert_eq!(b.phase(), Phase::Open);
    }

    #[test]
    fn concurrent_admits_after_cooldown_admit_one_trial() {
        use std::sync::Barrier;

        let reg = BreakerRegistry::new(cfg());
        for i in 0..3 {
            reg.admit("SPY", Uuid::new_v4(), t(i));
        }
        assert_eq!(reg.phase("SPY", t(3)), Phase::Open);

        let barrier = Barrier::new(8);
        let results: Vec<(Admission, Vec<Transition>)> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        reg.admit("SPY", Uuid::new_v4(), t(100))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let probes = results
            .iter()
            .filter(|(adm, _)| *adm == Admission::Allowed { probe: true })
            .count();
        let half_opens = results
            .iter()
            .flat_map(|(_, tr)| tr)
            .filter(|tr| tr.to == Phase::HalfOpen)
            .count();
        assert_eq!(probes, 1);
        assert_eq!(half_opens, 1);
        assert!(results
            .iter()
            .filter(|(adm, _)| *adm != Admission::Allowed { probe: true })
            .all(|(adm, _)| *adm == Admission::Suppressed { phase: Phase::HalfOpen }));
    }
}
