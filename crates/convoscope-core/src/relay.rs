//! Log relay between the background worker and the process-wide logger.
//!
//! The worker installs `RelayLayer` as its own subscriber, so its events never reach the global
//! subscriber directly. Each event becomes a `LogRecord` on a bounded queue; the owning side
//! drains the queue and replays records into the global `tracing` subscriber.
//!
//! ```text
//!  worker thread                          request-serving runtime
//!  tracing::info!() -> RelayLayer --mpsc--> LogRelay::drain -> tracing (fmt, EnvFilter)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::Context;

/// Target under which relayed records are re-emitted.
pub const RELAY_TARGET: &str = "convoscope::worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for RecordLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => RecordLevel::Trace,
            tracing::Level::DEBUG => RecordLevel::Debug,
            tracing::Level::INFO => RecordLevel::Info,
            tracing::Level::WARN => RecordLevel::Warn,
            tracing::Level::ERROR => RecordLevel::Error,
        }
    }
}

/// One structured log event produced inside the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: RecordLevel,
    pub target: String,
    pub message: String,
    /// Event fields keeping their recorded types (numbers and booleans stay JSON scalars).
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    pub timestamp_ms: i64,
}

impl LogRecord {
    /// The fields as one JSON object, keys in order.
    pub fn fields_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Captures the "message" field and every other field of a tracing event.
struct RecordVisitor<'a> {
    message: &'a mut String,
    fields: &'a mut BTreeMap<String, Value>,
}

impl RecordVisitor<'_> {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for RecordVisitor<'_> {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = value.to_string();
        } else {
            self.insert(field, Value::from(value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = format!("{:?}", value);
        } else {
            self.insert(field, Value::from(format!("{:?}", value)));
        }
    }
}

/// Producer half: a tracing layer that enqueues every event it sees.
#[derive(Clone)]
pub struct RelayLayer {
    tx: mpsc::Sender<LogRecord>,
    send_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

/// Consumer half: owned by the process holding the global subscriber.
pub struct LogRelay {
    rx: mpsc::Receiver<LogRecord>,
    dropped: Arc<AtomicU64>,
}

/// Create a relay with a queue of `capacity` records. A producer facing a full queue waits at
/// most `send_timeout`, then drops the record.
pub fn relay_channel(capacity: usize, send_timeout: Duration) -> (RelayLayer, LogRelay) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        RelayLayer {
            tx,
            send_timeout,
            dropped: Arc::clone(&dropped),
        },
        LogRelay { rx, dropped },
    )
}

impl RelayLayer {
    /// Enqueue a record, waiting a bounded time on a full queue. Returns false if dropped.
    /// Callers on one thread enqueue in call order, so per-producer ordering is preserved.
    pub fn enqueue(&self, record: LogRecord) -> bool {
        let deadline = Instant::now() + self.send_timeout;
        let mut pending = record;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    if Instant::now() >= deadline {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                    pending = back;
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(TrySendError::Closed(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
        }
    }
}

impl<S> tracing_subscriber::Layer<S> for RelayLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut message = String::new();
        let mut fields = BTreeMap::new();
        event.record(&mut RecordVisitor {
            message: &mut message,
            fields: &mut fields,
        });
        self.enqueue(LogRecord {
            level: event.metadata().level().into(),
            target: event.metadata().target().to_string(),
            message,
            fields,
            timestamp_ms: crate::types::now_ms(),
        });
    }
}

impl LogRelay {
    /// Replay records until every producer is gone. Returns the number replayed.
    pub async fn drain(&mut self) -> u64 {
        self.drain_with(|record| replay(&record)).await
    }

    pub async fn drain_with<F: FnMut(LogRecord)>(&mut self, mut sink: F) -> u64 {
        let mut n = 0;
        while let Some(record) = self.rx.recv().await {
            sink(record);
            n += 1;
        }
        n
    }

    /// Replay whatever is queued right now without waiting.
    pub fn drain_pending_with<F: FnMut(LogRecord)>(&mut self, mut sink: F) -> usize {
        let mut n = 0;
        while let Ok(record) = self.rx.try_recv() {
            sink(record);
            n += 1;
        }
        n
    }

    pub fn drain_pending(&mut self) -> usize {
        self.drain_pending_with(|record| replay(&record))
    }

    /// Records dropped by producers because the queue stayed full or was closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Re-emit a relayed record into the current subscriber, keeping its level and origin.
/// The worker's fields travel as one JSON object in the `fields` field.
pub fn replay(record: &LogRecord) {
    let fields = record.fields_json();
    let origin = record.target.as_str();
    let msg = record.message.as_str();
    match record.level {
        RecordLevel::Trace => {
            tracing::trace!(target: RELAY_TARGET, origin, fields = %fields, "{}", msg)
        }
        RecordLevel::Debug => {
            tracing::debug!(target: RELAY_TARGET, origin, fields = %fields, "{}", msg)
        }
        RecordLevel::Info => {
            tracing::info!(target: RELAY_TARGET, origin, fields = %fields, "{}", msg)
        }
        RecordLevel::Warn => {
            tracing::warn!(target: RELAY_TARGET, origin, fields = %fields, "{}", msg)
        }
        RecordLevel::Error => {
            tracing::error!(target: RELAY_TARGET, origin, fields = %fields, "{}", msg)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn record(message: &str) -> LogRecord {
        LogRecord {
            level: RecordLevel::Info,
            target: "test".to_string(),
            message: message.to_string(),
            fields: BTreeMap::new(),
            timestamp_ms: 0,
        }
    }

    #[test]
    fn layer_captures_message_level_and_fields() {
        let (layer, mut relay) = relay_channel(16, Duration::from_millis(10));
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(user_id = "u1", count = 3, "extraction slow");
        });

        let mut got = Vec::new();
        relay.drain_pending_with(|r| got.push(r));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].level, RecordLevel::Warn);
        assert_eq!(got[0].message, "extraction slow");
        assert_eq!(got[0].fields.get("user_id"), Some(&Value::from("u1")));
        assert_eq!(got[0].fields.get("count"), Some(&Value::from(3)));
        assert_eq!(got[0].fields_json(), r#"{"count":3,"user_id":"u1"}"#);
    }

    #[test]
    fn replay_keeps_fields_structured() {
        let (worker_layer, mut relay) = relay_channel(16, Duration::from_millis(10));
        let worker = tracing_subscriber::registry().with(worker_layer);
        tracing::subscriber::with_default(worker, || {
            tracing::info!(user_id = "u1", candidates = 2, slow = true, "extraction completed");
        });

        let (main_layer, mut replayed) = relay_channel(16, Duration::from_millis(10));
        let main = tracing_subscriber::registry().with(main_layer);
        tracing::subscriber::with_default(main, || {
            assert_eq!(relay.drain_pending(), 1);
        });

        let mut got = Vec::new();
        replayed.drain_pending_with(|r| got.push(r));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].target, RELAY_TARGET);
        assert_eq!(got[0].message, "extraction completed");
        let fields = got[0].fields.get("fields").and_then(Value::as_str).unwrap();
        let parsed: Value = serde_json::from_str(fields).unwrap();
        assert_eq!(parsed["user_id"], "u1");
        assert_eq!(parsed["candidates"], 2);
        assert_eq!(parsed["slow"], true);
    }

    #[test]
    fn producer_order_is_preserved() {
        let (layer, mut relay) = relay_channel(64, Duration::from_millis(10));
        for i in 0..20 {
            assert!(layer.enqueue(record(&format!("m{}", i))));
        }
        let mut got = Vec::new();
        relay.drain_pending_with(|r| got.push(r.message));
        let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn full_queue_blocks_at_most_the_timeout_then_drops() {
        let (layer, relay) = relay_channel(1, Duration::from_millis(20));
        assert!(layer.enqueue(record("fits")));
        let start = Instant::now();
        assert!(!layer.enqueue(record("dropped")));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(20));
        assert!(waited < Duration::from_secs(1));
        assert_eq!(relay.dropped(), 1);
    }

    #[test]
    fn closed_relay_drops_without_waiting() {
        let (layer, relay) = relay_channel(4, Duration::from_secs(5));
        let dropped = Arc::clone(&relay.dropped);
        drop(relay);
        let start = Instant::now();
        assert!(!layer.enqueue(record("late")));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn drain_runs_until_producers_are_gone() {
        let (layer, mut relay) = relay_channel(8, Duration::from_millis(10));
        let producer = std::thread::spawn(move || {
            for i in 0..5 {
                layer.enqueue(record(&format!("m{}", i)));
            }
        });
        let mut got = Vec::new();
        let n = relay.drain_with(|r| got.push(r.message)).await;
        producer.join().unwrap();
        assert_eq!(n, 5);
        assert_eq!(got.first().map(String::as_str), Some("m0"));
    }

    #[test]
    fn record_serialises_level_uppercase() {
        let json = serde_json::to_value(record("x")).unwrap();
        assert_eq!(json["level"], "INFO");
    }
}
