//! Per-user debounce of intermediate transcripts.
//!
//! Only intermediate (non-final) transcripts are throttled. Final transcripts always pass and
//! leave the throttle window untouched.

use dashmap::DashMap;
use std::time::Duration;

/// Tracks, per user, the timestamp of the last accepted intermediate transcript.
///
/// Entries are created lazily on the first accepted intermediate and live for the lifetime of
/// the filter. Each check-and-update runs under the user's shard lock, so concurrent requests
/// for the same user cannot both pass inside one window.
#[derive(Debug)]
pub struct DebounceFilter {
    interval_secs: f64,
    last_accepted: DashMap<String, f64>,
}

impl DebounceFilter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_secs: interval.as_secs_f64(),
            last_accepted: DashMap::new(),
        }
    }

    /// Decide whether an event is stored.
    ///
    /// An intermediate passes iff it is strictly more than the interval after the user's last
    /// accepted intermediate (or the user has none yet); on pass it becomes the new baseline.
    /// The baseline never moves backwards.
    pub fn accept(&self, user_id: &str, timestamp: f64, is_final: bool) -> bool {
        if is_final {
            return true;
        }
        match self.last_accepted.entry(user_id.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(timestamp);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let last = *slot.get();
                if timestamp - last > self.interval_secs {
                    *slot.get_mut() = timestamp;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Last accepted intermediate timestamp for a user.
    pub fn last_accepted(&self, user_id: &str) -> Option<f64> {
        self.last_accepted.get(user_id).map(|v| *v)
    }

    pub fn tracked_users(&self) -> usize {
        self.last_accepted.len()
    }
}
