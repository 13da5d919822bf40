//! # Rolling Window
//! Bounded per-ticker history of consensus scores, used for the momentum gate.
//!
//! Entries are kept in arrival order. The oldest entry is evicted once more
//! than `capacity` are stored, or once it falls outside the optional time
//! horizon. Not synchronized: it lives inside the ticker's state lock.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::aggregate::AggregatedSentiment;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct SentimentHistory {
    buf: VecDeque<HistoryEntry>,
    capacity: usize,
    horizon: Option<Duration>,
}

impl SentimentHistory {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize, horizon: Option<Duration>) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            horizon,
        }
    }

    /// Append a conclusive consensus; inconclusive ones are ignored.
    pub fn record(&mut self, agg: &AggregatedSentiment) {
        if agg.inconclusive {
            return;
        }
        self.push(HistoryEntry {
            at: agg.window_ts,
            score: agg.score,
            confidence: agg.confidence,
        });
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        let now = entry.at;
        self.buf.push_back(entry);
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
        }
        self.evict_older_than(now);
    }

    /// Drop entries outside the horizon, measured back from `now`.
    pub fn evict_older_than(&mut self, now: DateTime<Utc>) {
        let Some(horizon) = self.horizon else {
            return;
        };
        let Some(cutoff) = now.checked_sub_signed(horizon) else {
            return;
        };
        while let Some(front) = self.buf.front() {
            if front.at < cutoff {
                self.buf.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.buf.back()
    }

    /// Scores oldest → newest.
    pub fn scores(&self) -> Vec<f64> {
        self.buf.iter().map(|e| e.score).collect()
    }

    /// Mean score and sample count.
    pub fn average_and_count(&self) -> (f64, usize) {
        let n = self.buf.len();
        if n == 0 {
            return (0.0, 0);
        }
        (self.buf.iter().map(|e| e.score).sum::<f64>() / n as f64, n)
    }
}

/// Least-squares slope of `ys` against their index. `None` below two points.
pub fn linear_slope(ys: &[f64]) -> Option<f64> {
    let n = ys.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean_x = (nf - 1.0) / 2.0;
    let mean_y = ys.iter().sum::<f64>() / nf;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    Some(num / den)
}
