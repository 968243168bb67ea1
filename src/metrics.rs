//! In-process counter registry
//!
//! Tracks authorization outcomes, key-set refreshes, watch activity, and the
//! reserved-subject filter. All counters use atomic operations for
//! thread-safe updates without locks; labelled series use a concurrent map
//! keyed by the label tuple.
//!
//! Serving these counters over HTTP is an outer concern; this registry is
//! the seam an exporter reads. Tests read the same accessors.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;

/// Label key for the filtered-subject counter: one series per
/// (namespace, identity, list, reserved prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilteredSubjectKey {
    pub namespace: String,
    pub name: String,
    /// `"pub"` or `"sub"`
    pub list: &'static str,
    /// The reserved prefix that matched (`"_INBOX"` or `"_REPLY"`)
    pub prefix: &'static str,
}

/// Process-wide counter registry.
///
/// Obtain the shared instance via [`metrics()`]. Counters are monotonic and
/// eventually consistent (`Ordering::Relaxed` throughout); readers get a
/// snapshot, not a fence.
#[derive(Default)]
pub struct Metrics {
    authorizations_allowed: AtomicU64,
    authorizations_denied: AtomicU64,
    deny_reasons: DashMap<&'static str, AtomicU64>,
    filtered_subjects: DashMap<FilteredSubjectKey, AtomicU64>,
    keyset_refresh_ok: AtomicU64,
    keyset_refresh_failed: AtomicU64,
    keyset_refresh_throttled: AtomicU64,
    watch_events: DashMap<&'static str, AtomicU64>,
    watch_restarts: AtomicU64,
    read_through_hits: AtomicU64,
    read_through_misses: AtomicU64,
    read_through_errors: AtomicU64,
    broker_disconnects: AtomicU64,
}

impl Metrics {
    /// Record an allowed authorization.
    pub fn inc_allowed(&self) {
        self.authorizations_allowed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a denied authorization under the given reason label.
    pub fn inc_denied(&self, reason: &'static str) {
        self.authorizations_denied.fetch_add(1, Ordering::Relaxed);
        self.deny_reasons
            .entry(reason)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a subject stripped by the reserved-pattern filter.
    pub fn inc_filtered_subject(&self, key: FilteredSubjectKey) {
        self.filtered_subjects
            .entry(key)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a key-set refresh outcome.
    pub fn inc_keyset_refresh(&self, ok: bool) {
        if ok {
            self.keyset_refresh_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.keyset_refresh_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a refresh trigger suppressed by the rate-limit floor.
    ///
    /// A climbing value here means unknown-kid tokens are arriving faster
    /// than the resolver is willing to refetch.
    pub fn inc_keyset_refresh_throttled(&self) {
        self.keyset_refresh_throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one applied watch event (`"add"`, `"update"`, `"delete"`).
    pub fn inc_watch_event(&self, kind: &'static str) {
        self.watch_events
            .entry(kind)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a watch stream restart.
    pub fn inc_watch_restart(&self) {
        self.watch_restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read-through point read outcome.
    pub fn inc_read_through(&self, outcome: ReadThroughOutcome) {
        let counter = match outcome {
            ReadThroughOutcome::Hit => &self.read_through_hits,
            ReadThroughOutcome::Miss => &self.read_through_misses,
            ReadThroughOutcome::Error => &self.read_through_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a broker disconnect observed by the connection event callback.
    pub fn inc_broker_disconnect(&self) {
        self.broker_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    // --- snapshot accessors ---

    pub fn allowed(&self) -> u64 {
        self.authorizations_allowed.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.authorizations_denied.load(Ordering::Relaxed)
    }

    /// Deny count for one reason label.
    pub fn denied_for(&self, reason: &str) -> u64 {
        self.deny_reasons
            .get(reason)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Filtered-subject count for one label tuple.
    pub fn filtered_for(&self, key: &FilteredSubjectKey) -> u64 {
        self.filtered_subjects
            .get(key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn keyset_refreshes(&self) -> (u64, u64, u64) {
        (
            self.keyset_refresh_ok.load(Ordering::Relaxed),
            self.keyset_refresh_failed.load(Ordering::Relaxed),
            self.keyset_refresh_throttled.load(Ordering::Relaxed),
        )
    }

    pub fn watch_events_for(&self, kind: &str) -> u64 {
        self.watch_events
            .get(kind)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn watch_restarts(&self) -> u64 {
        self.watch_restarts.load(Ordering::Relaxed)
    }

    pub fn read_through_counts(&self) -> (u64, u64, u64) {
        (
            self.read_through_hits.load(Ordering::Relaxed),
            self.read_through_misses.load(Ordering::Relaxed),
            self.read_through_errors.load(Ordering::Relaxed),
        )
    }

    pub fn broker_disconnects(&self) -> u64 {
        self.broker_disconnects.load(Ordering::Relaxed)
    }
}

/// Outcome of a read-through point read against the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadThroughOutcome {
    Hit,
    Miss,
    Error,
}

static REGISTRY: Lazy<Metrics> = Lazy::new(Metrics::default);

/// Shared process-wide registry.
pub fn metrics() -> &'static Metrics {
    &REGISTRY
}
