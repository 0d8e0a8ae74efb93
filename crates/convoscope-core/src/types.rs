//! Shared pipeline types: transcript events, drained user transcripts, extraction
//! candidates and cycle bookkeeping.

use serde::{Deserialize, Serialize};

/// One speech transcript fragment as accepted by the ingestion gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub user_id: String,
    pub text: String,
    /// Seconds since the Unix epoch (fractional).
    pub timestamp: f64,
    pub is_final: bool,
}

/// All pending fragments of one user, combined for a single cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct UserTranscript {
    pub user_id: String,
    /// Fragment texts joined in arrival order with single spaces.
    pub text: String,
    pub fragments: usize,
    pub first_timestamp: f64,
    pub last_timestamp: f64,
}

impl UserTranscript {
    /// Combine a user's drained events (arrival order). Returns `None` for an empty slice.
    pub fn combine(user_id: &str, events: &[TranscriptEvent]) -> Option<Self> {
        let first = events.first()?;
        let last = events.last()?;
        let text = events
            .iter()
            .map(|e| e.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Some(Self {
            user_id: user_id.to_string(),
            text,
            fragments: events.len(),
            first_timestamp: first.timestamp,
            last_timestamp: last.timestamp,
        })
    }
}

/// Candidate item produced by the extraction engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub name: String,
    /// Engine-specific fields (description, url, image, ...), flattened on the wire.
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl ExtractionResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// Empty candidates (blank name) are skipped before the relevance gate.
    pub fn is_empty(&self) -> bool {
        self.name.trim().is_empty()
    }
}

/// A persisted, accepted result as handed to polling devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub seq: u64,
    /// Milliseconds since the Unix epoch when the cycle persisted the result.
    pub stored_at_ms: i64,
    #[serde(flatten)]
    pub result: ExtractionResult,
}

/// One row of a user's uploaded custom data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEntry {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// How the processing cycle contains a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureIsolation {
    /// First failure abandons the remaining users of the cycle.
    #[default]
    Cycle,
    /// A failure only drops the failing user's work for the cycle.
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Success,
    /// Store was not ready; body skipped.
    Skipped,
    /// Failed (the cycle-level error; with per-user isolation, the last one seen).
    Failed(String),
}

/// Bookkeeping for one cycle iteration. Logged, never persisted.
#[derive(Debug, Clone)]
pub struct CycleRun {
    pub started_at: std::time::Instant,
    pub finished_at: std::time::Instant,
    /// Users drained this cycle.
    pub users: usize,
    /// Results persisted in this cycle, summed over users.
    pub persisted: usize,
    pub outcome: CycleOutcome,
}

impl CycleRun {
    pub fn elapsed(&self) -> std::time::Duration {
        self.finished_at.duration_since(self.started_at)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Failed(_))
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Seconds since the Unix epoch, fractional.
pub fn now_secs() -> f64 {
    now_ms() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str, ts: f64, is_final: bool) -> TranscriptEvent {
        TranscriptEvent {
            user_id: "u1".to_string(),
            text: text.to_string(),
            timestamp: ts,
            is_final,
        }
    }

    #[test]
    fn combine_joins_in_arrival_order() {
        let events = vec![
            event("hello", 1.0, false),
            event(" there ", 1.5, false),
            event("", 1.7, false),
        ];
        let combined = UserTranscript::combine("u1", &events).unwrap();
        assert_eq!(combined.text, "hello there");
        assert_eq!(combined.fragments, 3);
        assert_eq!(combined.first_timestamp, 1.0);
        assert_eq!(combined.last_timestamp, 1.7);
    }

    #[test]
    fn combine_empty_is_none() {
        assert!(UserTranscript::combine("u1", &[]).is_none());
    }

    #[test]
    fn extraction_result_flattens_payload() {
        let r = ExtractionResult::new("Rust").with_field("url", "https://www.rust-lang.org");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["name"], "Rust");
        assert_eq!(json["url"], "https://www.rust-lang.org");
        assert!(ExtractionResult::new("  ").is_empty());
    }

    #[test]
    fn failure_isolation_parses_snake_case() {
        let f: FailureIsolation = serde_json::from_str("\"user\"").unwrap();
        assert_eq!(f, FailureIsolation::User);
        assert_eq!(FailureIsolation::default(), FailureIsolation::Cycle);
    }
}
