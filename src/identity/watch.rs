//! ServiceAccount watch consumer
//!
//! A long-lived watch over the workload identity collection keeps the
//! [`IdentityCache`] current. Events are applied from a single task, which
//! preserves per-key ordering; authorization handlers only ever read.
//!
//! Session shape: full list (which doubles as the reconcile sweep), then
//! watch from the returned resource version. The watch is re-established
//! from the last seen version when the server closes the window, re-listed
//! when the version has expired (410), and reconnected with exponential
//! backoff on transport errors. A periodic re-list bounds the staleness of
//! anything a dropped event left behind; entries that vanished from the
//! platform are swept out at the same time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{pin_mut, TryStreamExt};
use k8s_openapi::api::core::v1::ServiceAccount;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::identity::{ApplyOutcome, CapabilityProfile, IdentityCache, ProfileSource};
use crate::metrics::metrics;

/// Server-side watch window, seconds. The server closes the stream after
/// this long; we resume from the last seen resource version.
const WATCH_SESSION_TIMEOUT_SECS: u32 = 240;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Watch scope and cadence.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Restrict the watch to one namespace; `None` watches cluster-wide.
    pub namespace: Option<String>,
    /// Annotation key prefix recognized on records.
    pub annotation_prefix: String,
    /// Cadence of the full re-list reconcile sweep.
    pub reconcile_interval: Duration,
}

/// The single writer of the identity cache.
pub struct ServiceAccountWatcher {
    api: Api<ServiceAccount>,
    cache: Arc<IdentityCache>,
    config: WatchConfig,
}

impl ServiceAccountWatcher {
    pub fn new(client: Client, cache: Arc<IdentityCache>, config: WatchConfig) -> Self {
        let api = match config.namespace.as_deref() {
            Some(namespace) if !namespace.is_empty() => Api::namespaced(client, namespace),
            _ => Api::all(client),
        };
        Self { api, cache, config }
    }

    /// Drive the watch until the shutdown flag flips.
    ///
    /// Transport failures reconnect with exponential backoff (1 s doubling
    /// to 60 s), reset after a session that stayed up for a minute.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let session_started = Instant::now();
            match self.run_session(shutdown.clone()).await {
                Ok(()) => break,
                Err(err) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    metrics().inc_watch_restart();
                    if session_started.elapsed() > Duration::from_secs(60) {
                        backoff = INITIAL_BACKOFF;
                    }
                    warn!(
                        error = %err,
                        backoff_secs = backoff.as_secs(),
                        "workload identity watch failed, reconnecting"
                    );
                    let mut shutdown_wait = shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown_wait.changed() => break,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        debug!("workload identity watch stopped");
    }

    /// One connected session: list, then watch until shutdown or a
    /// transport error.
    async fn run_session(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut resource_version = self.reconcile().await?;
        let mut reconcile_timer = tokio::time::interval(self.config.reconcile_interval);
        reconcile_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; the list above already ran
        reconcile_timer.tick().await;

        loop {
            let params = WatchParams::default().timeout(WATCH_SESSION_TIMEOUT_SECS);
            let stream = self.api.watch(&params, &resource_version).await?;
            pin_mut!(stream);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return Ok(()),
                    _ = reconcile_timer.tick() => {
                        resource_version = self.reconcile().await?;
                        break;
                    }
                    event = stream.try_next() => match event? {
                        Some(event) => {
                            if !self.apply(event, &mut resource_version) {
                                // resource version expired under us; start over
                                resource_version = self.reconcile().await?;
                                break;
                            }
                        }
                        // server closed the watch window; resume from rv
                        None => break,
                    }
                }
            }
        }
    }

    /// Apply one watch event to the cache.
    ///
    /// Returns `false` when the event says our resource version is gone
    /// and the caller must re-list.
    fn apply(&self, event: WatchEvent<ServiceAccount>, resource_version: &mut String) -> bool {
        match event {
            WatchEvent::Added(record) => {
                self.track_version(&record, resource_version);
                self.upsert_record(&record, "add");
                true
            }
            WatchEvent::Modified(record) => {
                self.track_version(&record, resource_version);
                self.upsert_record(&record, "update");
                true
            }
            WatchEvent::Deleted(record) => {
                self.track_version(&record, resource_version);
                if let (Some(namespace), Some(name)) =
                    (record.metadata.namespace.as_deref(), record.metadata.name.as_deref())
                {
                    let removed = self.cache.remove(namespace, name);
                    metrics().inc_watch_event("delete");
                    debug!(namespace, name, removed, "workload identity deleted");
                }
                true
            }
            WatchEvent::Bookmark(bookmark) => {
                *resource_version = bookmark.metadata.resource_version;
                true
            }
            WatchEvent::Error(err) if err.code == 410 => {
                warn!(reason = %err.reason, "watch resource version expired, re-listing");
                false
            }
            WatchEvent::Error(err) => {
                warn!(code = err.code, reason = %err.reason, message = %err.message, "watch error event");
                true
            }
        }
    }

    fn track_version(&self, record: &ServiceAccount, resource_version: &mut String) {
        if let Some(version) = record.metadata.resource_version.clone() {
            *resource_version = version;
        }
    }

    fn upsert_record(&self, record: &ServiceAccount, kind: &'static str) {
        let Some(profile) = CapabilityProfile::from_service_account(&self.config.annotation_prefix, record)
        else {
            return;
        };
        let namespace = profile.namespace.clone();
        let name = profile.name.clone();
        let outcome = self.cache.upsert(profile);
        metrics().inc_watch_event(kind);
        match outcome {
            ApplyOutcome::Unchanged => {}
            outcome => debug!(namespace = %namespace, name = %name, ?outcome, "workload identity applied"),
        }
    }

    /// Full list of the watched scope: upsert everything present, sweep
    /// everything absent, return the list's resource version as the new
    /// watch starting point.
    async fn reconcile(&self) -> anyhow::Result<String> {
        let list = self.api.list(&ListParams::default()).await?;
        let mut known = HashSet::new();
        let mut upserts = 0usize;
        for record in &list.items {
            if let Some(profile) =
                CapabilityProfile::from_service_account(&self.config.annotation_prefix, record)
            {
                known.insert(profile.key());
                if self.cache.upsert(profile) != ApplyOutcome::Unchanged {
                    upserts += 1;
                }
            }
        }
        let removed = self.cache.retain_known(&known);
        let resource_version = list.metadata.resource_version.unwrap_or_else(|| "0".to_string());
        info!(
            identities = known.len(),
            upserts,
            removed,
            resource_version = %resource_version,
            "workload identity reconcile complete"
        );
        Ok(resource_version)
    }
}

/// Point-read implementation of [`ProfileSource`] backed by the platform
/// API, used by the cache's read-through fallback.
pub struct KubeProfileSource {
    client: Client,
    annotation_prefix: String,
}

impl KubeProfileSource {
    pub fn new(client: Client, annotation_prefix: impl Into<String>) -> Self {
        Self {
            client,
            annotation_prefix: annotation_prefix.into(),
        }
    }
}

#[async_trait::async_trait]
impl ProfileSource for KubeProfileSource {
    async fn fetch(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Option<CapabilityProfile>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let record = api.get_opt(name).await?;
        Ok(record
            .as_ref()
            .and_then(|r| CapabilityProfile::from_service_account(&self.annotation_prefix, r)))
    }
}
