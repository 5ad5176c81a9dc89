//! Free-text verdict parsing.
//!
//! Model replies are a fragile boundary: reviewers are asked for
//! APPROVE/REJECT plus reasoning and a confidence score, but the reply is
//! free text. All text heuristics live here behind a typed result so the
//! rest of the system never touches raw review text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// A reviewer's decision, normalized from free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Abstain,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approve => write!(f, "approve"),
            Decision::Reject => write!(f, "reject"),
            Decision::Abstain => write!(f, "abstain"),
        }
    }
}

/// Typed result of parsing one review reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    /// Confidence in [0, 1]. 0.0 when the reply gave no usable signal.
    pub confidence: f64,
    pub reasoning: String,
}

impl Verdict {
    /// The verdict recorded when the underlying call failed outright.
    pub fn abstained(reason: &str) -> Self {
        Self {
            decision: Decision::Abstain,
            confidence: 0.0,
            reasoning: reason.to_string(),
        }
    }
}

fn decision_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(approve[ds]?|reject(?:ed|s)?|abstain(?:ed|s)?)\b").unwrap()
    })
}

fn confidence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)confidence[^0-9]*([01](?:\.\d+)?|\d{1,3}\s*%)").unwrap()
    })
}

/// Parse a free-text review reply into a typed verdict.
///
/// The first APPROVE/REJECT/ABSTAIN keyword decides; a reply with none of
/// them is an abstention with confidence 0. Confidence accepts `0.8` or
/// `80%` after the word "confidence", clamped to [0, 1]; a decided reply
/// without a usable score defaults to 0.5.
pub fn parse_verdict(text: &str) -> Verdict {
    let decision = match decision_re().find(text) {
        Some(m) => {
            let word = m.as_str().to_ascii_lowercase();
            if word.starts_with("approve") {
                Decision::Approve
            } else if word.starts_with("reject") {
                Decision::Reject
            } else {
                Decision::Abstain
            }
        }
        None => {
            return Verdict {
                decision: Decision::Abstain,
                confidence: 0.0,
                reasoning: text.trim().to_string(),
            };
        }
    };

    let confidence = confidence_re()
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| {
            let raw = m.as_str().trim();
            if let Some(pct) = raw.strip_suffix('%') {
                pct.trim().parse::<f64>().unwrap_or(50.0) / 100.0
            } else {
                raw.parse::<f64>().unwrap_or(0.5)
            }
        })
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    Verdict {
        decision,
        confidence,
        reasoning: text.trim().to_string(),
    }
}

/// Keywords that mark an output as obviously unfinished.
///
/// Used by the deterministic fallback when the semantic validator's worker
/// call fails: validation degrades to this heuristic instead of blocking
/// the pipeline on infrastructure failure.
const UNFINISHED_MARKERS: &[&str] = &[
    "todo",
    "fixme",
    "not implemented",
    "unimplemented",
    "placeholder",
    "tbd",
    "coming soon",
];

/// Deterministic keyword-based quality check.
///
/// Rejects output containing unfinished-work markers, approves otherwise.
pub fn keyword_heuristic(output: &str) -> Verdict {
    let lower = output.to_lowercase();
    for marker in UNFINISHED_MARKERS {
        if lower.contains(marker) {
            return Verdict {
                decision: Decision::Reject,
                confidence: 0.5,
                reasoning: format!("output contains unfinished-work marker '{}'", marker),
            };
        }
    }
    Verdict {
        decision: Decision::Approve,
        confidence: 0.5,
        reasoning: "no unfinished-work markers found".to_string(),
    }
}
