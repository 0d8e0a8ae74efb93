//! Relevance gate: accept or reject a candidate before it is surfaced to the user.

use crate::error::PipelineResult;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Policy deciding whether a candidate name is worth surfacing for a user.
pub trait RelevanceGate: Send + Sync {
    fn should_run_for_text(&self, user_id: &str, candidate_name: &str) -> PipelineResult<bool>;
}

/// Rejects a candidate that was already accepted for the same user within a trailing window,
/// so one topic is not surfaced again on every cycle while it is being talked about.
/// Expired entries are swept at most once per window by the deciding call.
#[derive(Debug)]
pub struct RecencyRelevanceFilter {
    window: Duration,
    /// (user, lowercased name) -> when it was last accepted.
    last_surfaced: DashMap<(String, String), Instant>,
    last_pruned: Mutex<Instant>,
}

impl RecencyRelevanceFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_surfaced: DashMap::new(),
            last_pruned: Mutex::new(Instant::now()),
        }
    }

    pub fn should_run_at(&self, user_id: &str, candidate_name: &str, now: Instant) -> bool {
        let key = (user_id.to_string(), candidate_name.trim().to_lowercase());
        let accepted = match self.last_surfaced.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if now.saturating_duration_since(*slot.get()) > self.window {
                    *slot.get_mut() = now;
                    true
                } else {
                    false
                }
            }
        };
        self.maybe_prune(now);
        accepted
    }

    fn maybe_prune(&self, now: Instant) {
        let due = match self.last_pruned.lock() {
            Ok(mut last) if now.saturating_duration_since(*last) > self.window => {
                *last = now;
                true
            }
            _ => false,
        };
        if due {
            self.prune(now);
        }
    }

    /// Drop entries older than the window.
    pub fn prune(&self, now: Instant) {
        self.last_surfaced
            .retain(|_, seen| now.saturating_duration_since(*seen) <= self.window);
    }

    pub fn tracked(&self) -> usize {
        self.last_surfaced.len()
    }
}

impl RelevanceGate for RecencyRelevanceFilter {
    fn should_run_for_text(&self, user_id: &str, candidate_name: &str) -> PipelineResult<bool> {
        Ok(self.should_run_at(user_id, candidate_name, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_within_window_is_rejected() {
        let f = RecencyRelevanceFilter::new(Duration::from_secs(120));
        let t0 = Instant::now();
        assert!(f.should_run_at("u", "Rust", t0));
        assert!(!f.should_run_at("u", "rust ", t0 + Duration::from_secs(30)));
        assert!(f.should_run_at("u", "Rust", t0 + Duration::from_secs(121)));
    }

    #[test]
    fn users_and_names_are_independent() {
        let f = RecencyRelevanceFilter::new(Duration::from_secs(120));
        let t0 = Instant::now();
        assert!(f.should_run_at("a", "Rust", t0));
        assert!(f.should_run_at("b", "Rust", t0));
        assert!(f.should_run_at("a", "Tokio", t0));
    }

    #[test]
    fn prune_forgets_expired_entries() {
        let f = RecencyRelevanceFilter::new(Duration::from_secs(10));
        let t0 = Instant::now();
        f.should_run_at("u", "x", t0);
        f.should_run_at("u", "y", t0 + Duration::from_secs(8));
        f.prune(t0 + Duration::from_secs(12));
        assert_eq!(f.tracked(), 1);
    }

    #[test]
    fn gate_sweeps_expired_names_as_it_decides() {
        let f = RecencyRelevanceFilter::new(Duration::from_millis(1));
        for i in 0..1000 {
            assert!(f.should_run_for_text("u", &format!("name-{}", i)).unwrap());
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(f.should_run_for_text("u", "fresh").unwrap());
        assert_eq!(f.tracked(), 1);
    }
}
