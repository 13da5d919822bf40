//! # Pipeline
//! intake → budget → fan-out → aggregate → signal → breaker → dispatch.
//!
//! Items are processed concurrently. Scoring and aggregation need no shared
//! state; everything after that (rolling history, signal cooldown, breaker
//! admission) runs behind the ticker's `Ticket`, so per ticker it sees items
//! in arrival order with a single writer. The ticket is released right after
//! admission, before the dispatcher is awaited.
//!
//! Every stage enters the item's `LatencyBudget` first. Once the budget is
//! spent the item is abandoned for that ticker and no intent is emitted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::adapters::DynAdapter;
use crate::aggregate::{AggregatedSentiment, Aggregator};
use crate::breaker::{Admission, BreakerRegistry, BreakerSnapshot, Phase, Transition};
use crate::config::PipelineConfig;
use crate::content::ContentItem;
use crate::ensemble;
use crate::error::PipelineError;
use crate::events::{EventBus, PipelineEvent, Record, Recorder};
use crate::execution::{ExecutionDispatcher, ExecutionOutcome, TradeIntent};
use crate::latency::{LatencyBudget, Stage};
use crate::sequencer::{Ticket, TickerSequencer};
use crate::signal::{Direction, SignalGenerator, SignalReason, SignalState, TradeSignal};

/// What became of one ticker of one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemOutcome {
    Dispatched {
        intent: TradeIntent,
        outcome: ExecutionOutcome,
    },
    Hold {
        signal: TradeSignal,
    },
    /// Non-hold signal stopped by the circuit breaker.
    Suppressed {
        signal: TradeSignal,
        phase: Phase,
    },
    /// No model produced a usable score.
    Inconclusive {
        ticker: String,
    },
    BudgetExceeded {
        ticker: String,
        stage: Stage,
        elapsed_ms: u64,
    },
}

impl ItemOutcome {
    pub fn ticker(&self) -> &str {
        match self {
            ItemOutcome::Dispatched { intent, .. } => &intent.ticker,
            ItemOutcome::Hold { signal } | ItemOutcome::Suppressed { signal, .. } => &signal.ticker,
            ItemOutcome::Inconclusive { ticker } | ItemOutcome::BudgetExceeded { ticker, .. } => {
                ticker
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub item_id: Uuid,
    /// One per ticker, in the item's ticker order.
    pub outcomes: Vec<ItemOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickerSnapshot {
    pub ticker: String,
    pub sentiment: Option<AggregatedSentiment>,
    pub signal: Option<TradeSignal>,
    pub history_len: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub tickers: Vec<TickerSnapshot>,
    /// Keyed by breaker key: the ticker, or `*` in global scope.
    pub breakers: BTreeMap<String, BreakerSnapshot>,
}

struct TickerState {
    signal: SignalState,
    latest_sentiment: Option<AggregatedSentiment>,
    latest_signal: Option<TradeSignal>,
}

type TickerSlot = Arc<Mutex<TickerState>>;

pub struct Pipeline {
    config: Arc<PipelineConfig>,
    adapters: Vec<DynAdapter>,
    aggregator: Aggregator,
    generator: SignalGenerator,
    breakers: BreakerRegistry,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    recorder: Arc<dyn Recorder>,
    bus: EventBus,
    sequencer: TickerSequencer,
    tickers: RwLock<HashMap<String, TickerSlot>>,
}

impl Pipeline {
    /// `config` is expected to be validated already.
    pub fn new(
        config: Arc<PipelineConfig>,
        adapters: Vec<DynAdapter>,
        dispatcher: Arc<dyn ExecutionDispatcher>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        let aggregator = Aggregator::new(config.weights(), config.aggregation.disagreement_threshold);
        let generator = SignalGenerator::new(config.signal.clone());
        let breakers = BreakerRegistry::new(config.breaker.clone());
        let bus = EventBus::new(config.events.bus_capacity);
        tracing::info!(
            target: "pipeline",
            models = adapters.len(),
            dispatcher = dispatcher.name(),
            budget_ms = config.latency.total_ms,
            "pipeline ready"
        );
        Self {
            config,
            adapters,
            aggregator,
            generator,
            breakers,
            dispatcher,
            recorder,
            bus,
            sequencer: TickerSequencer::new(),
            tickers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.bus.subscribe()
    }

    /// Accept an item without waiting for it. The latency budget and the
    /// item's place in each ticker's line are fixed here, at arrival.
    pub fn intake(self: &Arc<Self>, item: ContentItem) -> JoinHandle<ItemReport> {
        let budget = LatencyBudget::start(self.config.latency);
        let tickets = self.sequencer.enter_all(&item.tickers);
        counter!("pipeline_items_total").increment(1);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(item, budget, tickets).await })
    }

    /// Process one item to completion on the caller's task.
    pub async fn process_item(&self, item: ContentItem) -> ItemReport {
        let budget = LatencyBudget::start(self.config.latency);
        let tickets = self.sequencer.enter_all(&item.tickers);
        counter!("pipeline_items_total").increment(1);
        self.run(item, budget, tickets).await
    }

    async fn run(&self, item: ContentItem, budget: LatencyBudget, tickets: Vec<Ticket>) -> ItemReport {
        let span = tracing::debug_span!(target: "pipeline", "item", item_id = %item.id, source = %item.source);
        let flows = item
            .tickers
            .iter()
            .zip(tickets)
            .map(|(ticker, ticket)| self.process_ticker(&item, ticker, budget, ticket));
        let outcomes = join_all(flows).instrument(span).await;

        let elapsed = budget.elapsed();
        histogram!("pipeline_latency_ms").record(elapsed.as_secs_f64() * 1000.0);
        tracing::debug!(
            target: "pipeline",
            item_id = %item.id,
            tickers = item.tickers.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "item done"
        );
        ItemReport {
            item_id: item.id,
            outcomes,
        }
    }

    async fn process_ticker(
        &self,
        item: &ContentItem,
        ticker: &str,
        budget: LatencyBudget,
        mut ticket: Ticket,
    ) -> ItemOutcome {
        // Fan-out.
        let clock = match budget.enter(Stage::FanOut) {
            Ok(c) => c,
            Err(e) => return self.budget_exceeded(item, ticker, e),
        };
        let scores = ensemble::fan_out(&item.text, ticker, &self.adapters, clock.ceiling()).await;
        clock.finish();

        // Aggregate.
        let clock = match budget.enter(Stage::Aggregate) {
            Ok(c) => c,
            Err(e) => return self.budget_exceeded(item, ticker, e),
        };
        let agg = self.aggregator.aggregate(ticker, &scores, item.timestamp);
        clock.finish();

        // Stateful tail: one writer per ticker, in arrival order.
        ticket.wait_turn().await;

        if agg.inconclusive {
            counter!("aggregation_inconclusive_total").increment(1);
            tracing::info!(target: "pipeline", item_id = %item.id, ticker, "inconclusive aggregation");
            self.bus.publish(PipelineEvent::InconclusiveAggregation {
                item_id: item.id,
                ticker: ticker.to_string(),
                scores,
            });
            return ItemOutcome::Inconclusive {
                ticker: ticker.to_string(),
            };
        }
        self.recorder.record(Record::Sentiment(agg.clone()));
        self.bus.publish(PipelineEvent::SentimentUpdate {
            item_id: item.id,
            sentiment: agg.clone(),
            scores,
        });

        // Signal.
        let clock = match budget.enter(Stage::Signal) {
            Ok(c) => c,
            Err(e) => return self.budget_exceeded(item, ticker, e),
        };
        let signal = {
            let slot = self.ticker_slot(ticker);
            let mut st = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let signal = self.generator.generate(&agg, item.engagement, &mut st.signal);
            st.latest_sentiment = Some(agg);
            st.latest_signal = Some(signal.clone());
            signal
        };
        clock.finish();

        counter!("signals_total", "direction" => signal.direction.as_str()).increment(1);
        if signal.reason == SignalReason::Cooldown {
            counter!("signals_suppressed_total", "reason" => SignalReason::Cooldown.as_str())
                .increment(1);
        }
        self.recorder.record(Record::Signal(signal.clone()));
        self.bus.publish(PipelineEvent::SignalGenerated {
            item_id: item.id,
            signal: signal.clone(),
        });
        if signal.direction == Direction::Hold {
            return ItemOutcome::Hold { signal };
        }

        // Breaker admission, then dispatch.
        let clock = match budget.enter(Stage::Dispatch) {
            Ok(c) => c,
            Err(e) => return self.budget_exceeded(item, ticker, e),
        };
        let deadline = Utc::now()
            + chrono::Duration::from_std(clock.ceiling()).unwrap_or_else(|_| chrono::Duration::zero());
        let mut intent =
            TradeIntent::from_signal(&signal, self.config.execution.max_position_size, deadline);

        let (admission, transitions) = self.breakers.admit(ticker, intent.id, Utc::now());
        self.publish_transitions(transitions);
        match admission {
            Admission::Suppressed { phase } => {
                let mut signal = signal;
                signal.reason = SignalReason::CircuitBreaker;
                counter!("signals_suppressed_total", "reason" => SignalReason::CircuitBreaker.as_str())
                    .increment(1);
                tracing::info!(
                    target: "pipeline",
                    item_id = %item.id,
                    ticker,
                    phase = phase.as_str(),
                    direction = signal.direction.as_str(),
                    "signal suppressed by circuit breaker"
                );
                self.bus.publish(PipelineEvent::SignalSuppressed {
                    item_id: item.id,
                    signal: signal.clone(),
                    phase,
                });
                clock.finish();
                return ItemOutcome::Suppressed { signal, phase };
            }
            Admission::Allowed { probe } => intent.probe = probe,
        }
        ticket.release();

        self.recorder.record(Record::Intent(intent.clone()));
        counter!("intents_dispatched_total").increment(1);
        let outcome = match tokio::time::timeout_at(clock.deadline(), self.dispatcher.dispatch(&intent)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => ExecutionOutcome::Rejected {
                reason: e.to_string(),
            },
            Err(_) => ExecutionOutcome::Rejected {
                reason: "dispatch timed out".into(),
            },
        };
        clock.finish();

        if let ExecutionOutcome::Rejected { reason } = &outcome {
            counter!("execution_rejected_total").increment(1);
            tracing::warn!(target: "execution", intent = %intent.id, ticker, %reason, "execution rejected");
        }
        self.settle(&intent, &outcome);
        ItemOutcome::Dispatched { intent, outcome }
    }

    /// Feed back a later outcome (e.g. a closed position) for `intent_id`.
    pub fn report_outcome(&self, ticker: &str, intent_id: Uuid, outcome: ExecutionOutcome) -> Vec<Transition> {
        let transitions = self.breakers.record_outcome(ticker, intent_id, &outcome, Utc::now());
        self.recorder.record(Record::Outcome {
            intent_id,
            ticker: ticker.to_string(),
            outcome,
        });
        self.publish_transitions(transitions.clone());
        transitions
    }

    /// Assert (`true`) or lift (`false`) the manual halt for `ticker`'s breaker.
    pub fn set_override(&self, ticker: &str, asserted: bool) -> Vec<Transition> {
        let transitions = self.breakers.set_override(ticker, asserted, Utc::now());
        tracing::warn!(target: "breaker", ticker, asserted, "manual override");
        self.publish_transitions(transitions.clone());
        transitions
    }

    pub fn breaker_phase(&self, ticker: &str) -> Phase {
        self.breakers.phase(ticker, Utc::now())
    }

    /// Latest sentiment and signal per ticker, plus every breaker.
    pub fn snapshot(&self) -> PipelineSnapshot {
        let slots: Vec<(String, TickerSlot)> = self
            .tickers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let mut tickers: Vec<TickerSnapshot> = slots
            .into_iter()
            .map(|(ticker, slot)| {
                let st = slot.lock().unwrap_or_else(PoisonError::into_inner);
                TickerSnapshot {
                    ticker,
                    sentiment: st.latest_sentiment.clone(),
                    signal: st.latest_signal.clone(),
                    history_len: st.signal.history.len(),
                }
            })
            .collect();
        tickers.sort_by(|a, b| a.ticker.cmp(&b.ticker));
        PipelineSnapshot {
            tickers,
            breakers: self.breakers.snapshot().into_iter().collect(),
        }
    }

    fn settle(&self, intent: &TradeIntent, outcome: &ExecutionOutcome) {
        let transitions = self
            .breakers
            .record_outcome(&intent.ticker, intent.id, outcome, Utc::now());
        self.publish_transitions(transitions);
        self.recorder.record(Record::Outcome {
            intent_id: intent.id,
            ticker: intent.ticker.clone(),
            outcome: outcome.clone(),
        });
        self.bus.publish(PipelineEvent::TradeExecuted {
            intent: intent.clone(),
            outcome: outcome.clone(),
        });
    }

    fn budget_exceeded(&self, item: &ContentItem, ticker: &str, err: PipelineError) -> ItemOutcome {
        let PipelineError::BudgetExceeded {
            stage,
            elapsed_ms,
            budget_ms,
        } = err;
        counter!("pipeline_budget_exceeded_total", "stage" => stage.as_str()).increment(1);
        tracing::warn!(
            target: "pipeline",
            item_id = %item.id,
            ticker,
            stage = stage.as_str(),
            elapsed_ms,
            budget_ms,
            "latency budget exceeded, item abandoned"
        );
        self.bus.publish(PipelineEvent::LatencyExceeded {
            item_id: item.id,
            ticker: ticker.to_string(),
            stage,
            elapsed_ms,
            budget_ms,
        });
        ItemOutcome::BudgetExceeded {
            ticker: ticker.to_string(),
            stage,
            elapsed_ms,
        }
    }

    fn publish_transitions(&self, transitions: Vec<Transition>) {
        for transition in transitions {
            self.bus
                .publish(PipelineEvent::CircuitBreakerStateChanged { transition });
        }
    }

    fn ticker_slot(&self, ticker: &str) -> TickerSlot {
        if let Some(s) = self
            .tickers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ticker)
        {
            return Arc::clone(s);
        }
        let mut w = self.tickers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(w.entry(ticker.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TickerState {
                signal: self.generator.new_state(),
                latest_sentiment: None,
                latest_signal: None,
            }))
        }))
    }
}
