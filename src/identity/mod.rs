//! Workload identity cache
//!
//! Process-wide mapping from `(namespace, name)` to the identity's parsed
//! [`CapabilityProfile`]. The watch consumer (see [`watch`]) is the single
//! writer; authorization handlers read concurrently. One `RwLock` guards
//! the map, profiles are immutable once published, so a reader that has
//! cloned the `Arc` needs no further synchronization.
//!
//! A `get` miss can fall through to a point read against the platform (the
//! [`ProfileSource`] seam) to close the race where a freshly created
//! workload connects before the watch has caught up. The watch remains the
//! source of truth: read-through inserts go through the same
//! resource-version tiebreaker as watch events, so a later (but older)
//! watch ADD cannot clobber a newer profile.

pub mod annotations;
pub mod watch;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use k8s_openapi::api::core::v1::ServiceAccount;
use tracing::{debug, warn};

use crate::metrics::{metrics, FilteredSubjectKey, ReadThroughOutcome};

use annotations::parse_annotations;

/// Default timeout for the read-through point read.
pub const DEFAULT_READ_THROUGH_TIMEOUT: Duration = Duration::from_millis(500);

/// Cache key: the identity of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub namespace: String,
    pub name: String,
}

impl IdentityKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Parsed form of a workload identity record.
///
/// Immutable once published into the cache; updates replace the whole
/// entry. The additional subject lists have already passed the reserved
/// pattern filter and preserve annotation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityProfile {
    pub namespace: String,
    pub name: String,
    pub additional_publish: Vec<String>,
    pub additional_subscribe: Vec<String>,
    /// Platform resource version, used as the upsert tiebreaker.
    pub resource_version: Option<String>,
    /// When the watch event or point read that produced this entry landed.
    pub last_synced_at: SystemTime,
}

impl CapabilityProfile {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        additional_publish: Vec<String>,
        additional_subscribe: Vec<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            additional_publish,
            additional_subscribe,
            resource_version: None,
            last_synced_at: SystemTime::now(),
        }
    }

    pub fn resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey::new(self.namespace.clone(), self.name.clone())
    }

    /// Content equality, ignoring the sync timestamp.
    fn same_content(&self, other: &CapabilityProfile) -> bool {
        self.namespace == other.namespace
            && self.name == other.name
            && self.additional_publish == other.additional_publish
            && self.additional_subscribe == other.additional_subscribe
            && self.resource_version == other.resource_version
    }

    /// Parse a ServiceAccount record into a profile.
    ///
    /// Returns `None` for records without a name or namespace (never the
    /// case for real API objects). Reserved subjects stripped from the
    /// annotations are counted and logged here, so both the watch path and
    /// the read-through path report them identically.
    pub fn from_service_account(prefix: &str, record: &ServiceAccount) -> Option<Self> {
        let name = record.metadata.name.clone()?;
        let namespace = record.metadata.namespace.clone()?;
        let empty = BTreeMap::new();
        let annotations = record.metadata.annotations.as_ref().unwrap_or(&empty);

        let parsed = parse_annotations(prefix, annotations);
        for filtered in &parsed.filtered {
            warn!(
                namespace = %namespace,
                name = %name,
                subject = %filtered.subject,
                list = filtered.list.as_label(),
                "dropping reserved subject from annotation; inbox grants are managed by the service"
            );
            metrics().inc_filtered_subject(FilteredSubjectKey {
                namespace: namespace.clone(),
                name: name.clone(),
                list: filtered.list.as_label(),
                prefix: filtered.reserved,
            });
        }

        Some(CapabilityProfile {
            namespace,
            name,
            additional_publish: parsed.publish,
            additional_subscribe: parsed.subscribe,
            resource_version: record.metadata.resource_version.clone(),
            last_synced_at: SystemTime::now(),
        })
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    /// Same content as the stored profile (resync replay); readers keep
    /// the existing entry.
    Unchanged,
    /// Incoming resource version is older than the stored one; dropped.
    StaleSkipped,
}

/// Point-read seam for the read-through fallback.
///
/// The production implementation wraps the platform client
/// ([`watch::KubeProfileSource`]); tests supply stubs.
#[async_trait::async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch(&self, namespace: &str, name: &str) -> anyhow::Result<Option<CapabilityProfile>>;
}

/// The live identity → capability mapping.
pub struct IdentityCache {
    entries: RwLock<HashMap<IdentityKey, Arc<CapabilityProfile>>>,
    source: Option<Arc<dyn ProfileSource>>,
    read_through_timeout: Duration,
}

impl IdentityCache {
    /// Create a cache without read-through.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            source: None,
            read_through_timeout: DEFAULT_READ_THROUGH_TIMEOUT,
        }
    }

    /// Enable the read-through fallback.
    pub fn with_source(mut self, source: Arc<dyn ProfileSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Override the read-through timeout.
    pub fn read_through_timeout(mut self, timeout: Duration) -> Self {
        self.read_through_timeout = timeout;
        self
    }

    /// Synchronous cache lookup.
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<CapabilityProfile>> {
        let entries = self.entries.read().expect("identity cache lock poisoned");
        entries
            .get(&IdentityKey::new(namespace, name))
            .cloned()
    }

    /// Lookup with read-through fallback.
    ///
    /// On a miss, performs one bounded point read against the platform and
    /// publishes the result through the normal upsert path. A miss that is
    /// still a miss after the point read is a definitive not-found for this
    /// request; the next watch event may change that.
    pub async fn resolve(&self, namespace: &str, name: &str) -> Option<Arc<CapabilityProfile>> {
        if let Some(profile) = self.get(namespace, name) {
            return Some(profile);
        }
        let source = self.source.as_ref()?;

        match tokio::time::timeout(self.read_through_timeout, source.fetch(namespace, name)).await
        {
            Ok(Ok(Some(profile))) => {
                metrics().inc_read_through(ReadThroughOutcome::Hit);
                debug!(namespace, name, "identity resolved by point read before watch caught up");
                self.upsert(profile);
                self.get(namespace, name)
            }
            Ok(Ok(None)) => {
                metrics().inc_read_through(ReadThroughOutcome::Miss);
                None
            }
            Ok(Err(err)) => {
                metrics().inc_read_through(ReadThroughOutcome::Error);
                warn!(namespace, name, error = %err, "point read against platform failed");
                None
            }
            Err(_) => {
                metrics().inc_read_through(ReadThroughOutcome::Error);
                warn!(
                    namespace,
                    name,
                    timeout_ms = self.read_through_timeout.as_millis() as u64,
                    "point read against platform timed out"
                );
                None
            }
        }
    }

    /// Insert or replace a profile.
    ///
    /// Replays of the same record are no-ops; a record carrying an older
    /// resource version than the stored one is dropped, which keeps a
    /// lagging watch stream from clobbering a fresher read-through insert.
    pub fn upsert(&self, profile: CapabilityProfile) -> ApplyOutcome {
        let key = profile.key();
        let mut entries = self.entries.write().expect("identity cache lock poisoned");
        if let Some(existing) = entries.get(&key) {
            if is_stale(existing.resource_version.as_deref(), profile.resource_version.as_deref()) {
                debug!(
                    namespace = %key.namespace,
                    name = %key.name,
                    stored = existing.resource_version.as_deref().unwrap_or("-"),
                    incoming = profile.resource_version.as_deref().unwrap_or("-"),
                    "dropping stale identity update"
                );
                return ApplyOutcome::StaleSkipped;
            }
            if existing.same_content(&profile) {
                return ApplyOutcome::Unchanged;
            }
            entries.insert(key, Arc::new(profile));
            ApplyOutcome::Replaced
        } else {
            entries.insert(key, Arc::new(profile));
            ApplyOutcome::Inserted
        }
    }

    /// Remove a profile. Removing an absent key is a no-op.
    pub fn remove(&self, namespace: &str, name: &str) -> bool {
        let mut entries = self.entries.write().expect("identity cache lock poisoned");
        entries.remove(&IdentityKey::new(namespace, name)).is_some()
    }

    /// Drop every entry not present in `known`; returns how many were
    /// removed. Used by the reconcile sweep after a full re-list.
    pub fn retain_known(&self, known: &HashSet<IdentityKey>) -> usize {
        let mut entries = self.entries.write().expect("identity cache lock poisoned");
        let before = entries.len();
        entries.retain(|key, _| known.contains(key));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("identity cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `true` when `incoming` is an older resource version than `stored`.
///
/// Resource versions are opaque strings; when both sides parse as integers
/// they are compared numerically, otherwise the update is applied (the
/// platform is the authority and equality is already handled by content
/// comparison).
fn is_stale(stored: Option<&str>, incoming: Option<&str>) -> bool {
    match (
        stored.and_then(|v| v.parse::<u64>().ok()),
        incoming.and_then(|v| v.parse::<u64>().ok()),
    ) {
        (Some(stored), Some(incoming)) => incoming < stored,
        _ => false,
    }
}
