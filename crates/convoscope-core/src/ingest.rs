//! Ingestion gateway: validate a transcript request, debounce it, hand it to the store.

use crate::debounce::DebounceFilter;
use crate::error::{PipelineError, PipelineResult};
use crate::store::TranscriptStore;
use crate::types::{now_secs, TranscriptEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Raw `/chat` body. Every field is optional on the wire so that a missing field is reported
/// as a validation error naming it, rather than a generic decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub is_final: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    /// False when the event was debounced. Not an error for the client.
    pub accepted: bool,
}

/// Timestamp used for the debounce decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampSource {
    /// Server receive time (client clocks drift and are ignored).
    Server,
    /// The validated client timestamp.
    Client,
}

/// Owns the per-user debounce state; only this gateway mutates it.
pub struct IngestionGateway {
    store: Arc<dyn TranscriptStore>,
    debounce: DebounceFilter,
    timestamps: TimestampSource,
}

impl IngestionGateway {
    pub fn new(
        store: Arc<dyn TranscriptStore>,
        debounce: DebounceFilter,
        timestamps: TimestampSource,
    ) -> Self {
        Self {
            store,
            debounce,
            timestamps,
        }
    }

    /// Validate, debounce and persist. Missing `text`, `timestamp` or `userId` (checked in that
    /// order) short-circuit with a validation error before any debounce bookkeeping.
    pub fn ingest(&self, req: IngestRequest) -> PipelineResult<IngestOutcome> {
        let text = non_empty(req.text).ok_or_else(|| PipelineError::missing_field("text"))?;
        let client_ts = parse_timestamp(req.timestamp.as_ref())
            .ok_or_else(|| PipelineError::missing_field("timestamp"))?;
        let user_id = non_empty(req.user_id).ok_or_else(|| PipelineError::missing_field("userId"))?;
        let is_final = req.is_final.unwrap_or(false);

        let timestamp = match self.timestamps {
            TimestampSource::Server => now_secs(),
            TimestampSource::Client => client_ts,
        };

        if !self.debounce.accept(&user_id, timestamp, is_final) {
            tracing::trace!(user_id = %user_id, timestamp, "debouncing intermediate transcript");
            return Ok(IngestOutcome { accepted: false });
        }

        if is_final {
            tracing::info!(user_id = %user_id, timestamp, text = %text, "final transcript");
        }
        self.store.append_transcript(&TranscriptEvent {
            user_id,
            text,
            timestamp,
            is_final,
        })?;
        Ok(IngestOutcome { accepted: true })
    }

    pub fn debounce(&self) -> &DebounceFilter {
        &self.debounce
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

/// Accepts a JSON number or a numeric string; empty strings and other types count as missing.
fn parse_timestamp(v: Option<&serde_json::Value>) -> Option<f64> {
    match v? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;
    use std::time::Duration;

    fn gateway() -> (IngestionGateway, Arc<SledStore>) {
        let store = Arc::new(SledStore::temporary().unwrap());
        let gw = IngestionGateway::new(
            store.clone(),
            DebounceFilter::new(Duration::from_millis(200)),
            TimestampSource::Client,
        );
        (gw, store)
    }

    fn req(user: &str, text: &str, ts: f64, is_final: bool) -> IngestRequest {
        IngestRequest {
            user_id: Some(user.to_string()),
            text: Some(text.to_string()),
            timestamp: Some(serde_json::json!(ts)),
            is_final: Some(is_final),
        }
    }

    #[test]
    fn second_rapid_intermediate_is_not_persisted() {
        let (gw, store) = gateway();
        assert!(gw.ingest(req("U", "hello", 0.0, false)).unwrap().accepted);
        assert!(!gw.ingest(req("U", "hello there", 0.05, false)).unwrap().accepted);
        assert_eq!(store.pending_len(), 1);
        let drained = store.drain_pending().unwrap();
        assert_eq!(drained[0].text, "hello");
    }

    #[test]
    fn final_after_rejected_intermediate_is_persisted() {
        let (gw, store) = gateway();
        assert!(gw.ingest(req("U", "final", 9.95, false)).unwrap().accepted);
        assert!(!gw.ingest(req("U", "final te", 9.99, false)).unwrap().accepted);
        assert!(gw.ingest(req("U", "final text", 10.0, true)).unwrap().accepted);
        assert_eq!(store.pending_len(), 2);
        assert_eq!(gw.debounce().last_accepted("U"), Some(9.95));
    }

    #[test]
    fn missing_user_id_names_the_field() {
        let (gw, store) = gateway();
        let mut r = req("U", "hi", 1.0, false);
        r.user_id = None;
        let err = gw.ingest(r).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "no userId in request");
        assert_eq!(store.pending_len(), 0);
        assert_eq!(gw.debounce().tracked_users(), 0);
    }

    #[test]
    fn empty_text_and_missing_timestamp_are_validation_errors() {
        let (gw, _) = gateway();
        let err = gw.ingest(req("U", "", 1.0, false)).unwrap_err();
        assert_eq!(err.to_string(), "no text in request");

        let mut r = req("U", "hi", 1.0, false);
        r.timestamp = Some(serde_json::json!(""));
        assert_eq!(gw.ingest(r).unwrap_err().to_string(), "no timestamp in request");
    }

    #[test]
    fn string_timestamp_is_accepted() {
        let (gw, _) = gateway();
        let mut r = req("U", "hi", 0.0, false);
        r.timestamp = Some(serde_json::json!("1700000000.5"));
        assert!(gw.ingest(r).unwrap().accepted);
        assert_eq!(gw.debounce().last_accepted("U"), Some(1_700_000_000.5));
    }

    #[test]
    fn server_timestamps_ignore_client_clock() {
        let store = Arc::new(SledStore::temporary().unwrap());
        let gw = IngestionGateway::new(
            store.clone(),
            DebounceFilter::new(Duration::from_millis(200)),
            TimestampSource::Server,
        );
        assert!(gw.ingest(req("U", "a", 1.0, false)).unwrap().accepted);
        let last = gw.debounce().last_accepted("U").unwrap();
        assert!(last > 1_600_000_000.0);
        // Client claims a much later time, but the server clock hasn't moved 200ms.
        assert!(!gw.ingest(req("U", "ab", 99.0, false)).unwrap().accepted);
    }
}
