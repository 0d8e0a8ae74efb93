//! Transcript, result and custom-data stores.
//!
//! Capability traits keep the processing cycle independent of the storage engine; `SledStore`
//! implements all three on one sled database (direct host filesystem, one tree per concern).

use crate::error::{PipelineError, PipelineResult};
use crate::types::{
    now_ms, CustomEntry, ExtractionResult, StoredResult, TranscriptEvent, UserTranscript,
};
use sled::transaction::ConflictableTransactionError;
use std::path::Path;

const TRANSCRIPTS_TREE: &str = "transcripts";
const RESULTS_TREE: &str = "results";
const CURSORS_TREE: &str = "device_cursors";
const CUSTOM_DATA_TREE: &str = "custom_data";

/// Durable buffer of pending transcript fragments per user.
pub trait TranscriptStore: Send + Sync {
    /// False until the store can serve drains. The cycle skips its body while not ready.
    fn is_ready(&self) -> bool;

    /// Append one accepted fragment to the user's pending buffer.
    fn append_transcript(&self, event: &TranscriptEvent) -> PipelineResult<()>;

    /// Fetch every pending fragment and clear it as one operation: a fragment is returned by
    /// exactly one drain, and a fragment appended during a drain is either part of it or left
    /// for the next one. On `StoreUnavailable` nothing was removed. Returns one combined
    /// transcript per user.
    fn drain_pending(&self) -> PipelineResult<Vec<UserTranscript>>;
}

/// Persists accepted results and serves them per (user, device).
pub trait ResultStore: Send + Sync {
    /// Persist one cycle's accepted results for a user (possibly empty).
    /// Returns the number stored.
    fn add_results(&self, user_id: &str, results: &[ExtractionResult]) -> PipelineResult<usize>;

    /// Results for the user that this device has not received yet; advances the device cursor.
    fn results_for_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> PipelineResult<Vec<StoredResult>>;
}

/// Per-user uploaded reference data used by the default extraction engine.
pub trait CustomDataStore: Send + Sync {
    /// Replace the user's custom data with a fresh upload.
    fn replace_custom_data(&self, user_id: &str, entries: &[CustomEntry]) -> PipelineResult<()>;

    fn custom_data(&self, user_id: &str) -> PipelineResult<Vec<CustomEntry>>;
}

/// Key layout: `{user_id bytes}{0x00}{seq u64 big-endian}`; sorts by user, then arrival.
fn seq_key(user_id: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + 9);
    key.extend_from_slice(user_id.as_bytes());
    key.push(0);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn split_seq_key(key: &[u8]) -> Option<(&str, u64)> {
    if key.len() < 9 {
        return None;
    }
    let (head, seq) = key.split_at(key.len() - 8);
    let user = std::str::from_utf8(&head[..head.len() - 1]).ok()?;
    let seq = u64::from_be_bytes(seq.try_into().ok()?);
    Some((user, seq))
}

fn cursor_key(user_id: &str, device_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(user_id.len() + device_id.len() + 1);
    key.extend_from_slice(user_id.as_bytes());
    key.push(0);
    key.extend_from_slice(device_id.as_bytes());
    key
}

fn decode_u64(bytes: &[u8]) -> u64 {
    bytes.try_into().map(u64::from_be_bytes).unwrap_or(0)
}

/// Sled-backed implementation of every store capability.
pub struct SledStore {
    db: sled::Db,
    transcripts: sled::Tree,
    results: sled::Tree,
    cursors: sled::Tree,
    custom: sled::Tree,
}

impl SledStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database removed on drop (tests, dry runs).
    pub fn temporary() -> PipelineResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> PipelineResult<Self> {
        Ok(Self {
            transcripts: db.open_tree(TRANSCRIPTS_TREE)?,
            results: db.open_tree(RESULTS_TREE)?,
            cursors: db.open_tree(CURSORS_TREE)?,
            custom: db.open_tree(CUSTOM_DATA_TREE)?,
            db,
        })
    }

    /// Number of fragments waiting for the next drain.
    pub fn pending_len(&self) -> usize {
        self.transcripts.len()
    }

    pub fn flush(&self) -> PipelineResult<usize> {
        Ok(self.db.flush()?)
    }
}

impl TranscriptStore for SledStore {
    /// Ready once the trees are open.
    fn is_ready(&self) -> bool {
        true
    }

    fn append_transcript(&self, event: &TranscriptEvent) -> PipelineResult<()> {
        let seq = self.db.generate_id()?;
        let value = serde_json::to_vec(event)?;
        self.transcripts.insert(seq_key(&event.user_id, seq), value)?;
        Ok(())
    }

    /// Removes every listed fragment in one transaction: either all of them leave the tree and
    /// are returned, or none do and the error is `StoreUnavailable`.
    fn drain_pending(&self) -> PipelineResult<Vec<UserTranscript>> {
        let keys: Vec<sled::IVec> = self
            .transcripts
            .iter()
            .keys()
            .collect::<Result<_, _>>()
            .map_err(|e| PipelineError::StoreUnavailable(e.to_string()))?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // A concurrent drain conflicts and is retried; it then sees the keys as gone.
        let values: Vec<sled::IVec> = self
            .transcripts
            .transaction(|tx| {
                let mut values = Vec::with_capacity(keys.len());
                for key in &keys {
                    if let Some(value) = tx.remove(key.clone())? {
                        values.push(value);
                    }
                }
                Ok::<_, ConflictableTransactionError<()>>(values)
            })
            .map_err(|e| PipelineError::StoreUnavailable(format!("drain failed: {:?}", e)))?;

        let mut grouped: Vec<(String, Vec<TranscriptEvent>)> = Vec::new();
        for value in values {
            let event: TranscriptEvent = match serde_json::from_slice(&value) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unreadable transcript record");
                    continue;
                }
            };
            match grouped.last_mut() {
                Some((user, events)) if *user == event.user_id => events.push(event),
                _ => grouped.push((event.user_id.clone(), vec![event])),
            }
        }

        Ok(grouped
            .iter()
            .filter_map(|(user, events)| UserTranscript::combine(user, events))
            .collect())
    }
}

impl ResultStore for SledStore {
    fn add_results(&self, user_id: &str, results: &[ExtractionResult]) -> PipelineResult<usize> {
        let stored_at_ms = now_ms();
        let mut batch = sled::Batch::default();
        for result in results {
            let seq = self.db.generate_id()?;
            let stored = StoredResult {
                seq,
                stored_at_ms,
                result: result.clone(),
            };
            batch.insert(seq_key(user_id, seq), serde_json::to_vec(&stored)?);
        }
        self.results.apply_batch(batch)?;
        Ok(results.len())
    }

    fn results_for_device(
        &self,
        user_id: &str,
        device_id: &str,
    ) -> PipelineResult<Vec<StoredResult>> {
        let ckey = cursor_key(user_id, device_id);
        // The cursor holds the last delivered seq; a new device starts from seq 0.
        let first = match self.cursors.get(&ckey)? {
            Some(last) => match decode_u64(&last).checked_add(1) {
                Some(next) => next,
                None => return Ok(Vec::new()),
            },
            None => 0,
        };

        let mut out = Vec::new();
        for item in self
            .results
            .range(seq_key(user_id, first)..=seq_key(user_id, u64::MAX))
        {
            let (key, value) = item?;
            match split_seq_key(&key) {
                Some((user, _)) if user == user_id => {}
                _ => continue,
            }
            out.push(serde_json::from_slice::<StoredResult>(&value)?);
        }

        if let Some(last) = out.last().map(|r| r.seq) {
            // Cursor only moves forward, even if two polls of one device race.
            self.cursors.update_and_fetch(&ckey, |old| {
                let next = match old {
                    Some(current) => decode_u64(current).max(last),
                    None => last,
                };
                Some(next.to_be_bytes().to_vec())
            })?;
        }
        Ok(out)
    }
}

impl CustomDataStore for SledStore {
    fn replace_custom_data(&self, user_id: &str, entries: &[CustomEntry]) -> PipelineResult<()> {
        self.custom.insert(user_id.as_bytes(), serde_json::to_vec(entries)?)?;
        Ok(())
    }

    fn custom_data(&self, user_id: &str) -> PipelineResult<Vec<CustomEntry>> {
        match self.custom.get(user_id.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn event(user: &str, text: &str, ts: f64) -> TranscriptEvent {
        TranscriptEvent {
            user_id: user.to_string(),
            text: text.to_string(),
            timestamp: ts,
            is_final: false,
        }
    }

    #[test]
    fn seq_key_round_trips_user_and_seq() {
        let key = seq_key("alice", 42);
        assert_eq!(split_seq_key(&key), Some(("alice", 42)));
        assert!(split_seq_key(b"short").is_none());
    }

    #[test]
    fn drain_combines_per_user_and_clears() {
        let store = SledStore::temporary().unwrap();
        store.append_transcript(&event("a", "hello", 1.0)).unwrap();
        store.append_transcript(&event("b", "bonjour", 1.1)).unwrap();
        store.append_transcript(&event("a", "world", 1.4)).unwrap();

        let drained = store.drain_pending().unwrap();
        assert_eq!(drained.len(), 2);
        let a = drained.iter().find(|t| t.user_id == "a").unwrap();
        assert_eq!(a.text, "hello world");
        assert_eq!(a.fragments, 2);
        assert_eq!(store.pending_len(), 0);
        assert!(store.drain_pending().unwrap().is_empty());
    }

    #[test]
    fn events_after_drain_land_in_next_drain_only() {
        let store = SledStore::temporary().unwrap();
        store.append_transcript(&event("a", "first", 1.0)).unwrap();
        let first = store.drain_pending().unwrap();
        store.append_transcript(&event("a", "second", 2.0)).unwrap();
        let second = store.drain_pending().unwrap();
        assert_eq!(first[0].text, "first");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].text, "second");
    }

    #[test]
    fn concurrent_appends_during_drains_are_delivered_exactly_once() {
        let store = Arc::new(SledStore::temporary().unwrap());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..500 {
                    store.append_transcript(&event("a", &format!("w{}", i), i as f64)).unwrap();
                }
            })
        };

        let mut seen: Vec<String> = Vec::new();
        while !writer.is_finished() {
            for t in store.drain_pending().unwrap() {
                seen.extend(t.text.split(' ').map(str::to_string));
            }
        }
        writer.join().unwrap();
        for t in store.drain_pending().unwrap() {
            seen.extend(t.text.split(' ').map(str::to_string));
        }

        let unique: HashSet<&String> = seen.iter().collect();
        assert_eq!(seen.len(), 500);
        assert_eq!(unique.len(), 500);
    }

    #[test]
    fn device_cursor_delivers_each_result_once_per_device() {
        let store = SledStore::temporary().unwrap();
        let results = vec![
            ExtractionResult::new("Ada Lovelace"),
            ExtractionResult::new("Analytical Engine"),
        ];
        assert_eq!(store.add_results("u", &results).unwrap(), 2);

        let phone = store.results_for_device("u", "phone").unwrap();
        assert_eq!(phone.len(), 2);
        assert_eq!(phone[0].result.name, "Ada Lovelace");
        assert!(store.results_for_device("u", "phone").unwrap().is_empty());

        // A second device has its own cursor.
        assert_eq!(store.results_for_device("u", "glasses").unwrap().len(), 2);

        store.add_results("u", &[ExtractionResult::new("Babbage")]).unwrap();
        let next = store.results_for_device("u", "phone").unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].result.name, "Babbage");
    }

    #[test]
    fn first_result_in_a_fresh_database_is_delivered() {
        let store = SledStore::temporary().unwrap();
        store.add_results("u1", &[ExtractionResult::new("Rust")]).unwrap();

        let delivered = store.results_for_device("u1", "d1").unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].seq, 0);
        assert_eq!(delivered[0].result.name, "Rust");
        assert!(store.results_for_device("u1", "d1").unwrap().is_empty());
    }

    #[test]
    fn concurrent_drains_split_fragments_without_overlap() {
        let store = Arc::new(SledStore::temporary().unwrap());
        for i in 0..300 {
            store
                .append_transcript(&event(&format!("u{}", i % 7), &format!("w{}", i), i as f64))
                .unwrap();
        }

        let drainers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    let mut words = Vec::new();
                    for t in store.drain_pending().unwrap() {
                        words.extend(t.text.split(' ').map(str::to_string));
                    }
                    words
                })
            })
            .collect();
        let seen: Vec<String> = drainers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let unique: HashSet<&String> = seen.iter().collect();
        assert_eq!(seen.len(), 300);
        assert_eq!(unique.len(), 300);
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn results_do_not_leak_between_users_sharing_a_prefix() {
        let store = SledStore::temporary().unwrap();
        store.add_results("ab", &[ExtractionResult::new("x")]).unwrap();
        assert!(store.results_for_device("a", "d").unwrap().is_empty());
        assert_eq!(store.results_for_device("ab", "d").unwrap().len(), 1);
    }

    #[test]
    fn empty_result_list_persists_nothing() {
        let store = SledStore::temporary().unwrap();
        assert_eq!(store.add_results("u", &[]).unwrap(), 0);
        assert!(store.results_for_device("u", "d").unwrap().is_empty());
    }

    #[test]
    fn custom_data_upload_replaces_previous() {
        let store = SledStore::temporary().unwrap();
        assert!(store.custom_data("u").unwrap().is_empty());
        let first = vec![CustomEntry {
            name: "Rust".into(),
            description: "A language".into(),
            url: None,
        }];
        store.replace_custom_data("u", &first).unwrap();
        let second = vec![CustomEntry {
            name: "Tokio".into(),
            description: "A runtime".into(),
            url: Some("https://tokio.rs".into()),
        }];
        store.replace_custom_data("u", &second).unwrap();
        assert_eq!(store.custom_data("u").unwrap(), second);
    }
}
