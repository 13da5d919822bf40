use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;

use super::{ModelAdapter, RawScore};
use crate::error::AdapterError;

static LEXICON: Lazy<HashMap<String, i32>> = Lazy::new(|| {
    let raw = include_str!("../../sentiment_lexicon.json");
    serde_json::from_str::<HashMap<String, i32>>(raw).unwrap_or_default()
});

/// Confidence when no lexicon word matched at all.
const NO_HIT_CONFIDENCE: f64 = 0.2;

/// In-process lexicon scorer. Always available, never slow; useful as the
/// fallback member of an ensemble.
#[derive(Debug, Clone)]
pub struct LexiconAdapter {
    id: String,
    timeout: Duration,
}

impl LexiconAdapter {
    pub fn new(id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            timeout,
        }
    }

    /// Returns `(summed score, matched words)`.
    /// Negation: a negator within the previous 1..=3 tokens flips the word's sign.
    pub fn raw_score(text: &str) -> (i32, usize) {
        let tokens: Vec<String> = tokenize(text).collect();
        let mut score: i32 = 0;
        let mut hits = 0usize;

        for i in 0..tokens.len() {
            let base = *LEXICON.get(tokens[i].as_str()).unwrap_or(&0);
            if base == 0 {
                continue;
            }
            let negated = (1..=3).any(|k| i >= k && is_negator(&tokens, i - k));
            score += if negated { -base } else { base };
            hits += 1;
        }

        (score, hits)
    }

    /// Squash the integer score into `[-1, 1]`; more matched words, more confidence.
    pub fn score_text(text: &str) -> RawScore {
        let (score, hits) = Self::raw_score(text);
        if hits == 0 {
            return RawScore {
                sentiment: 0.0,
                confidence: NO_HIT_CONFIDENCE,
            };
        }
        RawScore {
            sentiment: (score as f64 / 2.0).tanh(),
            confidence: (0.5 + 0.15 * hits as f64).min(0.95),
        }
    }
}

#[async_trait]
impl ModelAdapter for LexiconAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn score(
        &self,
        text: &str,
        _ticker: &str,
        _deadline: Duration,
    ) -> Result<RawScore, AdapterError> {
        Self::score_text(text).validated()
    }
}

fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
}

fn is_negator(tokens: &[String], j: usize) -> bool {
    match tokens[j].as_str() {
        "not" | "no" | "never" | "cannot" | "without" => true,
        // Contraction stems only negate as "<stem>'t"; "won" alone is past tense of "win".
        "isn" | "wasn" | "aren" | "weren" | "won" | "don" | "doesn" | "didn" | "can" => {
            tokens.get(j + 1).is_some_and(|t| t == "t")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_headline_scores_positive() {
        let s = LexiconAdapter::score_text("Stocks rally as earnings beat estimates");
        assert!(s.sentiment > 0.5, "got {s:?}");
        assert!(s.confidence > 0.5);
    }

    #[test]
    fn negation_flips_sign() {
        let (plain, _) = LexiconAdapter::raw_score("outlook is strong");
        let (negated, _) = LexiconAdapter::raw_score("outlook is not strong");
        assert!(plain > 0);
        assert_eq!(negated, -plain);
    }

    #[test]
    fn contractions_negate_but_past_tense_does_not() {
        let (won, _) = LexiconAdapter::raw_score("Apple won a strong contract");
        let (plain, _) = LexiconAdapter::raw_score("Apple a strong contract");
        assert!(won > 0);
        assert_eq!(won, plain);

        let (wont, _) = LexiconAdapter::raw_score("Apple won't see strong demand");
        assert_eq!(wont, -plain);
        let (isnt, _) = LexiconAdapter::raw_score("demand isn't strong");
        assert_eq!(isnt, -plain);
    }

    #[test]
    fn no_hits_is_neutral_and_unsure() {
        let s = LexiconAdapter::score_text("The committee met on Tuesday");
        assert_eq!(s.sentiment, 0.0);
        assert_eq!(s.confidence, NO_HIT_CONFIDENCE);
    }
}
