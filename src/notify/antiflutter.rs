// src/notify/antiflutter.rs
use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Per-breaker cooldown gate to prevent alert spam.
/// - First alert for a key always allowed.
/// - Inside cooldown, alerts for that key are suppressed.
/// - State is updated explicitly via `record_alert` after a successful send.
#[derive(Debug, Clone, Default)]
pub struct AntiFlutter {
    cooldown: ChronoDuration,
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl AntiFlutter {
    /// `cooldown_secs` < 0 is treated as 0 (no cooldown).
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown: ChronoDuration::seconds(cooldown_secs.max(0)),
            last_alert: HashMap::new(),
        }
    }

    /// Does NOT mutate state.
    pub fn should_alert(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.last_alert.get(key) {
            None => true,
            Some(ts) => now.signed_duration_since(*ts) >= self.cooldown,
        }
    }

    pub fn record_alert(&mut self, key: &str, now: DateTime<Utc>) {
        self.last_alert.insert(key.to_string(), now);
    }
}
