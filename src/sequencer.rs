//! Per-ticker arrival-order turnstile.
//!
//! Items are scored concurrently, but the stateful tail of the pipeline
//! (history, cooldown, breaker admission) must see a ticker's items in the
//! order they arrived. Each item takes a `Ticket` per ticker at intake; a
//! ticket's turn comes once the previous ticket for the same ticker has been
//! released or dropped. Tickets of different tickers never wait on each other.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

#[derive(Debug, Default)]
pub struct TickerSequencer {
    tails: Mutex<HashMap<String, oneshot::Receiver<()>>>,
}

impl TickerSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next place in line for `ticker`.
    pub fn enter(&self, ticker: &str) -> Ticket {
        let mut tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
        queue(&mut tails, ticker)
    }

    /// Take places for every ticker of one item atomically, so two
    /// multi-ticker items can never queue in opposite orders.
    pub fn enter_all(&self, tickers: &[String]) -> Vec<Ticket> {
        let mut tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
        tickers.iter().map(|t| queue(&mut tails, t)).collect()
    }

    /// Tickers seen so far.
    pub fn len(&self) -> usize {
        self.tails.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn queue(tails: &mut HashMap<String, oneshot::Receiver<()>>, ticker: &str) -> Ticket {
    let (tx, rx) = oneshot::channel();
    let prev = tails.insert(ticker.to_string(), rx);
    Ticket {
        prev,
        next: Some(tx),
    }
}

/// One item's place in one ticker's line. Dropping it lets the next one in.
#[derive(Debug)]
pub struct Ticket {
    prev: Option<oneshot::Receiver<()>>,
    next: Option<oneshot::Sender<()>>,
}

impl Ticket {
    /// Resolves once every earlier ticket for the ticker is released.
    pub async fn wait_turn(&mut self) {
        if let Some(rx) = self.prev.as_mut() {
            // A dropped predecessor releases us just the same.
            let _ = rx.await;
            self.prev = None;
        }
    }

    pub fn release(mut self) {
        if self.prev.is_none() {
            if let Some(tx) = self.next.take() {
                let _ = tx.send(());
            }
        }
    }
}

impl Drop for Ticket {
    /// A ticket abandoned before its turn hands its place on only once the
    /// predecessor is done, so later items never overtake earlier ones.
    fn drop(&mut self) {
        if let (Some(prev), Some(next)) = (self.prev.take(), self.next.take()) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = prev.await;
                    let _ = next.send(());
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn later_ticket_waits_for_earlier() {
        let seq = TickerSequencer::new();
        let mut first = seq.enter("SPY");
        let mut second = seq.enter("SPY");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o2 = Arc::clone(&order);
        let h2 = tokio::spawn(async move {
            second.wait_turn().await;
            o2.lock().unwrap().push(2);
        });
        let o1 = Arc::clone(&order);
        let h1 = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            first.wait_turn().await;
            o1.lock().unwrap().push(1);
            first.release();
        });
        h1.await.unwrap();
        h2.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn dropped_ticket_releases_successor() {
        let seq = TickerSequencer::new();
        let first = seq.enter("QQQ");
        let mut second = seq.enter("QQQ");
        drop(first);
        tokio::time::timeout(Duration::from_secs(1), second.wait_turn())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_middle_ticket_keeps_order() {
        let seq = TickerSequencer::new();
        let mut first = seq.enter("IWM");
        let middle = seq.enter("IWM");
        let mut last = seq.enter("IWM");
        drop(middle);

        let blocked = tokio::time::timeout(Duration::from_millis(50), last.wait_turn()).await;
        assert!(blocked.is_err(), "must not overtake the first ticket");

        first.wait_turn().await;
        first.release();
        tokio::time::timeout(Duration::from_secs(1), last.wait_turn())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tickers_are_independent() {
        let seq = TickerSequencer::new();
        let _held = seq.enter_all(&["AAPL".to_string()]);
        let mut other = seq.enter("MSFT");
        tokio::time::timeout(Duration::from_secs(1), other.wait_turn())
            .await
            .unwrap();
        assert_eq!(seq.len(), 2);
    }
}
