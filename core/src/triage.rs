//! Lightweight textual triage.
//!
//! Scores a message for urgency/emotional state before dispatch. The result
//! is a routing signal handed back to the caller as metadata; it is never
//! persisted with the conversation and the dispatcher itself does not act
//! on it.
//!
//! The mechanism is fixed (control tokens, then weighted pattern scoring,
//! then ordered thresholds); the pattern lists are an injected lexicon so
//! the scorer stays language-agnostic.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;

/// Classification levels, most urgent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriageLevel {
    Panic,
    PrePanic,
    Anxiety,
    Stable,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriageResult {
    pub level: TriageLevel,
    pub intensity: u8,
    pub indicators: Vec<String>,
}

impl TriageResult {
    fn code(level: TriageLevel, intensity: u8, indicator: &str) -> Self {
        Self {
            level,
            intensity,
            indicators: vec![indicator.to_string()],
        }
    }
}

/// Language-specific pattern configuration.
///
/// `panic` and `anxiety` are ordered `(label, regex)` lists matched against
/// the lower-cased text; labels double as indicator identifiers. The control
/// tokens short-circuit everything else.
#[derive(Debug, Clone)]
pub struct TriageLexicon {
    pub alarm_token: String,
    pub reset_token: String,
    pub panic: Vec<(String, String)>,
    pub anxiety: Vec<(String, String)>,
    pub pre_panic_phrase: String,
}

impl Default for TriageLexicon {
    fn default() -> Self {
        let own = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(label, pattern)| (label.to_string(), pattern.to_string()))
                .collect()
        };
        Self {
            alarm_token: "alarm".into(),
            reset_token: "kura".into(),
            panic: own(&[
                ("breathless", r"can'?t breathe|cannot breathe|short of breath"),
                ("racing-heart", r"heart (is )?(racing|pounding)"),
                ("fear-of-dying", r"going to die|i'?m dying|afraid to die"),
                ("impending-doom", r"something (bad |terrible )?is (going|about) to happen"),
                ("onset", r"it'?s starting( again)?"),
                ("panic-word", r"\bpanic"),
                ("help-word", r"\bhelp\b"),
                ("rescue-word", r"\brescue\b"),
            ]),
            anxiety: own(&[
                ("what-if", r"what if"),
                ("scared", r"i'?m scared"),
                ("fear", r"\bfear\b"),
                ("dread", r"\bdread\b"),
                ("unease", r"\bunease\b|\buneasy\b"),
            ]),
            pre_panic_phrase: "i feel that".into(),
        }
    }
}

pub struct TriageClassifier {
    alarm_token: String,
    reset_token: String,
    panic: Vec<(String, Regex)>,
    anxiety: Vec<(String, Regex)>,
    pre_panic_phrase: String,
}

impl TriageClassifier {
    pub fn new(lexicon: TriageLexicon) -> Result<Self> {
        let compile = |pairs: Vec<(String, String)>| -> Result<Vec<(String, Regex)>> {
            pairs
                .into_iter()
                .map(|(label, pattern)| {
                    let regex = Regex::new(&pattern)
                        .with_context(|| format!("invalid triage pattern {label}"))?;
                    Ok((label, regex))
                })
                .collect()
        };
        Ok(Self {
            alarm_token: lexicon.alarm_token.to_lowercase(),
            reset_token: lexicon.reset_token.to_lowercase(),
            panic: compile(lexicon.panic)?,
            anxiety: compile(lexicon.anxiety)?,
            pre_panic_phrase: lexicon.pre_panic_phrase.to_lowercase(),
        })
    }

    pub fn with_default_lexicon() -> Result<Self> {
        Self::new(TriageLexicon::default())
    }

    /// Deterministic, pure classification of one message.
    pub fn classify(&self, text: &str) -> TriageResult {
        let lowered = text.to_lowercase();

        // Control tokens take precedence over all scoring.
        if lowered.contains(&self.alarm_token) {
            return TriageResult::code(TriageLevel::Panic, 10, "CODE_ALARM");
        }
        if lowered.contains(&self.reset_token) {
            return TriageResult::code(TriageLevel::Reset, 0, "CODE_KURA");
        }

        let mut indicators = Vec::new();
        let mut panic_score = 0u32;
        for (label, pattern) in &self.panic {
            if pattern.is_match(&lowered) {
                panic_score += 3;
                indicators.push(label.clone());
            }
        }

        let chaos_score = chaos_score(text);

        let mut anxiety_score = 0u32;
        for (_, pattern) in &self.anxiety {
            if pattern.is_match(&lowered) {
                anxiety_score += 1;
            }
        }

        let total = panic_score + chaos_score + anxiety_score;

        if panic_score >= 3 || chaos_score >= 2 {
            TriageResult {
                level: TriageLevel::Panic,
                intensity: total.min(10) as u8,
                indicators,
            }
        } else if panic_score > 0 || lowered.contains(&self.pre_panic_phrase) {
            TriageResult {
                level: TriageLevel::PrePanic,
                intensity: total.min(7) as u8,
                indicators,
            }
        } else if anxiety_score > 0 {
            TriageResult {
                level: TriageLevel::Anxiety,
                intensity: anxiety_score.min(5) as u8,
                indicators,
            }
        } else {
            TriageResult {
                level: TriageLevel::Stable,
                intensity: 0,
                indicators: Vec::new(),
            }
        }
    }
}

/// One point each for: all-uppercase text, more than two ellipsis
/// sequences, fewer than five words with an exclamation mark.
fn chaos_score(text: &str) -> u32 {
    let mut score = 0;
    if is_shouted(text) {
        score += 1;
    }
    if text.matches("...").count() > 2 {
        score += 1;
    }
    if text.split_whitespace().count() < 5 && text.contains('!') {
        score += 1;
    }
    score
}

fn is_shouted(text: &str) -> bool {
    let mut cased = text.chars().filter(|c| c.is_alphabetic()).peekable();
    cased.peek().is_some() && cased.all(|c| !c.is_lowercase())
}
