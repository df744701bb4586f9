//! Row schemas of the two persisted CSV views.
//!
//! Kept in their own crate so downstream tooling (spreadsheets exports,
//! dashboards) can read the digests without pulling in the classifier stack.

use serde::{Deserialize, Serialize};

/// Reserved sophism key for undisclosed subject matter (money, authority,
/// promises) that is not itself a rhetorical fallacy.
pub const HIDDEN_TOPIC_KEY: &str = "hidden_topic";

// ── Severity ─────────────────────────────────────────────────────────────

/// Classifier-assigned severity tier. Ordered: `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Lenient parse of a classifier-supplied tier name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" | "faible" | "minor" => Some(Self::Low),
            "medium" | "moderate" | "moyen" | "moyenne" => Some(Self::Medium),
            "high" | "severe" | "élevé" | "elevee" | "haute" | "major" => Some(Self::High),
            _ => None,
        }
    }

    /// Tier implied by a confidence score when the classifier gave none.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.75 {
            Self::High
        } else if confidence >= 0.4 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

// ── Rich view: one row per detection event ──────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichRow {
    pub message_id: String,
    pub year: i32,
    pub sender: String,
    pub speaker: String,
    /// RFC 3339 when the message date parsed, otherwise the raw date text
    pub timestamp: String,
    pub theme: String,
    /// SHA-256 of the message body at classification time
    pub body_hash: String,
    pub sophism_key: String,
    pub label: String,
    pub severity: Severity,
    pub confidence: f64,
    /// Literal substring of the message body
    pub excerpt: String,
    pub note: String,
    /// Character offset where the analysed body was cut, if it was
    pub truncated_at: Option<usize>,
    pub recorded_at: String,
}

// ── Light view: one row per processed message ───────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightRow {
    pub message_id: String,
    pub year: i32,
    pub sender: String,
    pub speaker: String,
    pub timestamp: String,
    pub body_hash: String,
    pub event_count: usize,
    pub max_severity: Option<Severity>,
    /// Sophism key of the first most-severe event
    pub top_finding: Option<String>,
    /// Set when only a prefix of the body was analysed
    pub truncated_at: Option<usize>,
    pub processed_at: String,
}

impl LightRow {
    pub fn is_truncated(&self) -> bool {
        self.truncated_at.is_some()
    }
}
