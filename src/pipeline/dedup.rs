//! Dedup ledger: remembers which (source, message id) pairs were forwarded.
//!
//! Expired entries are evicted lazily on insert; there is no background
//! sweep. An optional entry cap evicts the oldest records first.
//!
//! Thread-safe: share via `Arc<DedupLedger>`. `admit` is an atomic
//! check-and-insert, so two concurrent calls for the same key can never both
//! return `true`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::pipeline::types::MessageRef;

/// Default retention horizon (24 hours).
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default)]
struct LedgerState {
    /// Key → time the record was admitted.
    records: HashMap<MessageRef, DateTime<Utc>>,
    /// Insertion order, for eviction. May hold stale entries for keys that
    /// were released or re-admitted; those are skipped on eviction.
    order: VecDeque<(MessageRef, DateTime<Utc>)>,
}

/// Short-retention record of forwarded messages.
#[derive(Debug)]
pub struct DedupLedger {
    retention: chrono::Duration,
    max_entries: Option<usize>,
    state: Mutex<LedgerState>,
}

impl DedupLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX),
            max_entries: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Cap the number of live records.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A panic while holding the lock cannot leave the maps inconsistent
        // beyond a stale order entry, so keep going with the inner state.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `(source_id, message_id)` as delivered at `now`.
    ///
    /// Returns `true` if the pair was not seen within the retention horizon
    /// (and is now recorded), `false` if it is a duplicate.
    pub fn admit(&self, source_id: &str, message_id: &str, now: DateTime<Utc>) -> bool {
        let key = MessageRef::new(source_id, message_id);
        let mut state = self.lock();

        self.evict_expired(&mut state, now);

        if let Some(seen_at) = state.records.get(&key) {
            if now.signed_duration_since(*seen_at) < self.retention {
                debug!(message = %key, "Duplicate message rejected by ledger");
                return false;
            }
        }

        state.records.insert(key.clone(), now);
        state.order.push_back((key, now));
        self.enforce_cap(&mut state);
        true
    }

    /// Forget a record whose delivery did not complete.
    ///
    /// Returns `true` if a record was removed.
    pub fn release(&self, source_id: &str, message_id: &str) -> bool {
        let key = MessageRef::new(source_id, message_id);
        let removed = self.lock().records.remove(&key).is_some();
        if removed {
            debug!(message = %key, "Released ledger record");
        }
        removed
    }

    /// Whether the pair is currently recorded (ignores expiry).
    pub fn contains(&self, source_id: &str, message_id: &str) -> bool {
        self.lock()
            .records
            .contains_key(&MessageRef::new(source_id, message_id))
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(&self, state: &mut LedgerState, now: DateTime<Utc>) {
        while let Some((_, admitted_at)) = state.order.front() {
            if now.signed_duration_since(*admitted_at) < self.retention {
                break;
            }
            if let Some((key, admitted_at)) = state.order.pop_front() {
                remove_if_current(state, &key, admitted_at);
            }
        }
    }

    fn enforce_cap(&self, state: &mut LedgerState) {
        let Some(max) = self.max_entries else {
            return;
        };
        while state.records.len() > max {
            let Some((key, admitted_at)) = state.order.pop_front() else {
                break;
            };
            remove_if_current(state, &key, admitted_at);
        }
    }
}

/// Remove `key` only if its record still carries `admitted_at`.
fn remove_if_current(state: &mut LedgerState, key: &MessageRef, admitted_at: DateTime<Utc>) {
    if state.records.get(key) == Some(&admitted_at) {
        state.records.remove(key);
    }
}

impl Default for DedupLedger {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn first_admit_wins_within_horizon() {
        let ledger = DedupLedger::new(Duration::from_secs(60));
        assert!(ledger.admit("group-A", "1", t(0)));
        assert!(!ledger.admit("group-A", "1", t(10)));
        assert!(!ledger.admit("group-A", "1", t(59)));
    }

    #[test]
    fn readmits_after_horizon() {
        let ledger = DedupLedger::new(Duration::from_secs(60));
        assert!(ledger.admit("group-A", "1", t(0)));
        assert!(ledger.admit("group-A", "1", t(60)));
        assert!(!ledger.admit("group-A", "1", t(61)));
    }

    #[test]
    fn same_message_id_in_different_sources_is_distinct() {
        let ledger = DedupLedger::default();
        assert!(ledger.admit("group-A", "1", t(0)));
        assert!(ledger.admit("group-B", "1", t(0)));
    }

    #[test]
    fn expired_records_are_evicted_on_insert() {
        let ledger = DedupLedger::new(Duration::from_secs(60));
        for i in 0..10 {
            assert!(ledger.admit("a", &i.to_string(), t(i)));
        }
        assert_eq!(ledger.len(), 10);

        assert!(ledger.admit("a", "late", t(200)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn release_allows_readmission() {
        let ledger = DedupLedger::default();
        assert!(ledger.admit("a", "1", t(0)));
        assert!(ledger.release("a", "1"));
        assert!(!ledger.contains("a", "1"));
        assert!(ledger.admit("a", "1", t(1)));
        assert!(!ledger.release("a", "missing"));
    }

    #[test]
    fn stale_order_entry_does_not_evict_readmitted_record() {
        let ledger = DedupLedger::new(Duration::from_secs(60));
        assert!(ledger.admit("a", "1", t(0)));
        ledger.release("a", "1");
        assert!(ledger.admit("a", "1", t(30)));

        // The t(0) order entry expires here; the t(30) record must survive.
        assert!(ledger.admit("a", "2", t(70)));
        assert!(!ledger.admit("a", "1", t(71)));
    }

    #[test]
    fn entry_cap_evicts_oldest() {
        let ledger = DedupLedger::default().with_max_entries(3);
        for i in 0..5 {
            assert!(ledger.admit("a", &i.to_string(), t(i)));
        }
        assert_eq!(ledger.len(), 3);
        assert!(!ledger.contains("a", "0"));
        assert!(!ledger.contains("a", "1"));
        assert!(ledger.contains("a", "4"));
    }

    #[test]
    fn concurrent_admits_for_one_key_admit_once() {
        let ledger = Arc::new(DedupLedger::default());
        let now = Utc::now();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.admit("group-A", "99", now))
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
