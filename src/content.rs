// src/content.rs
//! Content items as delivered by ingestion, plus the text cleanup applied
//! before anything is scored.

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scorers truncate long inputs anyway; keep the cap in one place.
const MAX_TEXT_CHARS: usize = 4000;

/// One news article or social post. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: Uuid,
    /// Upper-cased, de-duplicated, never empty.
    pub tickers: Vec<String>,
    pub text: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    /// Likes/retweets/comments or similar; 0 for sources without one.
    pub engagement: f64,
}

/// Raw shape accepted at intake (HTTP, replay files, connectors).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeItem {
    #[serde(default)]
    pub tickers: Vec<String>,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub headline: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub engagement: Option<f64>,
}

impl IntakeItem {
    /// Build the immutable item. `None` when there is nothing to score or
    /// nothing to trade.
    pub fn into_content(self) -> Option<ContentItem> {
        let text = build_text(
            self.headline.as_deref(),
            self.summary.as_deref(),
            self.text.as_deref(),
        );
        if text.is_empty() {
            return None;
        }

        let mut tickers: Vec<String> = Vec::new();
        for t in self.tickers.iter().chain(self.ticker.iter()) {
            let t = t.trim().to_ascii_uppercase();
            if !t.is_empty() && !tickers.contains(&t) {
                tickers.push(t);
            }
        }
        if tickers.is_empty() {
            return None;
        }

        Some(ContentItem {
            id: Uuid::new_v4(),
            tickers,
            text,
            source: self.source,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            engagement: self
                .engagement
                .filter(|e| e.is_finite() && *e >= 0.0)
                .unwrap_or(0.0),
        })
    }
}

/// Headline and summary joined with a space; explicit `text` wins when given.
pub fn build_text(headline: Option<&str>, summary: Option<&str>, text: Option<&str>) -> String {
    if let Some(t) = text.map(normalize_text).filter(|t| !t.is_empty()) {
        return t;
    }
    let h = headline.map(normalize_text).unwrap_or_default();
    let s = summary.map(normalize_text).unwrap_or_default();
    match (h.is_empty(), s.is_empty()) {
        (false, false) => format!("{h} {s}"),
        (false, true) => h,
        (true, false) => s,
        (true, true) => String::new(),
    }
}

/// Decode HTML entities, strip tags, normalize typographic quotes, collapse
/// whitespace and cap the length.
pub fn normalize_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}
