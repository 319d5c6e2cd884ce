//! Relay statistics: lock-free counters plus per-source connection status.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pipeline::connection::ConnectionState;

/// Per-source status shown in snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub state: ConnectionState,
    pub forwarded: u64,
    pub reconnects: u64,
}

/// Counters updated by the source workers.
#[derive(Debug)]
pub struct RelayStats {
    started_at: DateTime<Utc>,
    received: AtomicU64,
    filtered_out: AtomicU64,
    duplicates: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
    malformed: AtomicU64,
    sources: Mutex<BTreeMap<String, SourceStatus>>,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub received: u64,
    pub filtered_out: u64,
    pub duplicates: u64,
    pub forwarded: u64,
    pub failed: u64,
    pub malformed: u64,
    pub sources: BTreeMap<String, SourceStatus>,
}

impl StatsSnapshot {
    /// True when at least one source is currently streaming.
    pub fn any_streaming(&self) -> bool {
        self.sources
            .values()
            .any(|s| s.state == ConnectionState::Streaming)
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            received: AtomicU64::new(0),
            filtered_out: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            sources: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register_source(&self, id: &str, name: &str) {
        self.with_sources(|sources| {
            sources.entry(id.to_string()).or_insert_with(|| SourceStatus {
                name: name.to_string(),
                state: ConnectionState::Disconnected,
                forwarded: 0,
                reconnects: 0,
            });
        });
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered_out(&self) {
        self.filtered_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, source_id: &str) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.with_sources(|sources| {
            if let Some(status) = sources.get_mut(source_id) {
                status.forwarded += 1;
            }
        });
    }

    pub fn record_state(&self, source_id: &str, state: ConnectionState) {
        self.with_sources(|sources| {
            if let Some(status) = sources.get_mut(source_id) {
                status.state = state;
            }
        });
    }

    pub fn record_reconnect(&self, source_id: &str) {
        self.with_sources(|sources| {
            if let Some(status) = sources.get_mut(source_id) {
                status.reconnects += 1;
            }
        });
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Utc::now();
        StatsSnapshot {
            started_at: self.started_at,
            uptime_secs: now.signed_duration_since(self.started_at).num_seconds(),
            received: self.received.load(Ordering::Relaxed),
            filtered_out: self.filtered_out.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            sources: self.with_sources(|sources| sources.clone()),
        }
    }

    fn with_sources<R>(&self, f: impl FnOnce(&mut BTreeMap<String, SourceStatus>) -> R) -> R {
        let mut guard = self
            .sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}
