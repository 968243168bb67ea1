//! Issuer key-set resolution
//!
//! Maintains the token issuer's current public key set (a JWKS document)
//! and answers `kid` lookups from the token validator. The set is fetched
//! from a URL on an interval, or loaded from a local file for tests and
//! bootstrap.
//!
//! # Rotation model
//!
//! Each successful refresh parses a complete new [`KeySet`] and publishes it
//! atomically with an `ArcSwap`; the previous set stays readable until the
//! swap and is never mutated in place. Lookups therefore never block on the
//! refresher. A lookup that misses triggers at most one on-demand refresh
//! (subject to the rate-limit floor) and retries once against the new set.
//!
//! A failed refresh keeps the previous set; callers never observe an empty
//! set once one has been published.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::metrics::metrics;

/// Where the key set is fetched from.
#[derive(Debug, Clone)]
pub enum KeySetSource {
    /// Issuer JWKS endpoint, fetched over HTTPS on a schedule.
    Url(Url),
    /// Local JWKS file. Read once per refresh; intended for tests and
    /// air-gapped bootstrap, not rotation-aware production use.
    File(PathBuf),
}

/// One usable verification key from the issuer document.
#[derive(Clone)]
pub struct VerificationKey {
    pub kid: String,
    pub algorithm: Algorithm,
    pub decoding: DecodingKey,
}

/// Immutable snapshot of the issuer's keys, indexed by `kid`.
#[derive(Default)]
pub struct KeySet {
    keys: HashMap<String, Arc<VerificationKey>>,
}

impl KeySet {
    pub fn get(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        self.keys.get(kid).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// What caused a refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Initial fetch at startup.
    Startup,
    /// Periodic background schedule.
    Scheduled,
    /// A lookup missed on an unknown `kid`.
    UnknownKid,
}

/// Result of a refresh attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new set was published.
    Refreshed,
    /// Suppressed by the rate-limit floor; the current set is unchanged.
    Throttled,
    /// Fetch or parse failed; the current set is unchanged.
    Failed,
}

struct RefreshGate {
    last_attempt: Option<Instant>,
}

/// Fetches and owns the issuer key set.
///
/// Shared behind an `Arc`: the token validator calls [`lookup`], the
/// background task calls [`run`]. The refresh gate is a single async mutex,
/// so concurrent unknown-kid triggers coalesce into one fetch and the
/// stragglers observe the freshly published set.
///
/// [`lookup`]: KeySetResolver::lookup
/// [`run`]: KeySetResolver::run
pub struct KeySetResolver {
    source: KeySetSource,
    client: reqwest::Client,
    current: ArcSwap<KeySet>,
    gate: tokio::sync::Mutex<RefreshGate>,
    min_refresh_gap: Duration,
    fetch_timeout: Duration,
}

impl KeySetResolver {
    /// Create a resolver with an empty initial set.
    ///
    /// Call [`KeySetResolver::prime`] at startup to perform the first fetch;
    /// until a set has been published every lookup will attempt a refresh.
    pub fn new(source: KeySetSource, min_refresh_gap: Duration, fetch_timeout: Duration) -> Self {
        Self {
            source,
            client: reqwest::Client::new(),
            current: ArcSwap::from_pointee(KeySet::default()),
            gate: tokio::sync::Mutex::new(RefreshGate { last_attempt: None }),
            min_refresh_gap,
            fetch_timeout,
        }
    }

    /// Atomic snapshot of the current set.
    pub fn current(&self) -> Arc<KeySet> {
        self.current.load_full()
    }

    /// Look up a verification key by `kid`.
    ///
    /// On a miss, triggers one on-demand refresh (subject to the rate-limit
    /// floor) and retries once. Returns `None` if the key is still absent;
    /// the caller maps that to its unknown-key deny. The miss path is the
    /// only place a lookup can suspend.
    pub async fn lookup(&self, kid: &str) -> Option<Arc<VerificationKey>> {
        if let Some(key) = self.current.load().get(kid) {
            return Some(key);
        }
        debug!(kid, "kid not in current key set, triggering refresh");
        self.refresh(RefreshTrigger::UnknownKid).await;
        self.current.load().get(kid)
    }

    /// Initial fetch at startup.
    ///
    /// Failure is not fatal: the resolver keeps running with an empty set
    /// and the first lookup re-triggers a fetch once the gap allows.
    pub async fn prime(&self) -> RefreshOutcome {
        self.refresh(RefreshTrigger::Startup).await
    }

    /// Attempt a refresh now.
    ///
    /// Serialized through the gate mutex: whoever holds it performs the
    /// fetch, everyone queued behind observes the updated `last_attempt`
    /// and is throttled. A refresh attempt counts against the gap whether
    /// or not it succeeds, so a flapping issuer endpoint cannot be hammered
    /// by unknown-kid traffic.
    pub async fn refresh(&self, trigger: RefreshTrigger) -> RefreshOutcome {
        let mut gate = self.gate.lock().await;
        if let Some(last) = gate.last_attempt {
            if last.elapsed() < self.min_refresh_gap {
                if trigger == RefreshTrigger::UnknownKid {
                    metrics().inc_keyset_refresh_throttled();
                }
                debug!(?trigger, "key set refresh suppressed by rate limit");
                return RefreshOutcome::Throttled;
            }
        }
        gate.last_attempt = Some(Instant::now());

        let started = Instant::now();
        match self.fetch_key_set().await {
            Ok(set) if !set.is_empty() => {
                let key_count = set.len();
                self.current.store(Arc::new(set));
                metrics().inc_keyset_refresh(true);
                info!(
                    ?trigger,
                    key_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "key set refreshed"
                );
                RefreshOutcome::Refreshed
            }
            Ok(_) => {
                // A document with zero usable keys would lock every client
                // out; treat it as a failed refresh and keep the old set.
                metrics().inc_keyset_refresh(false);
                warn!(?trigger, "key set refresh produced no usable keys, keeping previous set");
                RefreshOutcome::Failed
            }
            Err(err) => {
                metrics().inc_keyset_refresh(false);
                warn!(?trigger, error = %err, "key set refresh failed, keeping previous set");
                RefreshOutcome::Failed
            }
        }
    }

    async fn fetch_key_set(&self) -> anyhow::Result<KeySet> {
        let bytes = match &self.source {
            KeySetSource::Url(url) => {
                let response = tokio::time::timeout(
                    self.fetch_timeout,
                    self.client.get(url.clone()).send(),
                )
                .await
                .map_err(|_| anyhow::anyhow!("key set fetch timed out after {:?}", self.fetch_timeout))??;
                response.error_for_status()?.bytes().await?.to_vec()
            }
            KeySetSource::File(path) => std::fs::read(path)?,
        };
        parse_key_set(&bytes)
    }

    /// Background refresh loop. Runs until the shutdown flag flips.
    ///
    /// The startup fetch is [`KeySetResolver::prime`]; this loop only
    /// handles the steady-state schedule.
    pub async fn run(
        self: Arc<Self>,
        refresh_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // interval fires immediately; startup already primed
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh(RefreshTrigger::Scheduled).await;
                }
                _ = shutdown.changed() => {
                    debug!("key set refresher stopping");
                    break;
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct JwksDocument {
    #[serde(default)]
    keys: Vec<Jwk>,
}

#[derive(Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    alg: Option<String>,
    // RSA
    n: Option<String>,
    e: Option<String>,
    // oct
    k: Option<String>,
}

/// Parse a JWKS document into a [`KeySet`].
///
/// RSA keys cover the production issuer; `oct` (symmetric) entries are
/// accepted so local test issuers can sign with HS256. Entries with an
/// unsupported `kty`/`alg` combination or missing material are skipped,
/// not fatal: one exotic key in the issuer document must not take down
/// rotation for the rest.
fn parse_key_set(bytes: &[u8]) -> anyhow::Result<KeySet> {
    use base64::Engine as _;

    let document: JwksDocument = serde_json::from_slice(bytes)?;
    let mut keys = HashMap::new();
    for jwk in document.keys {
        let Some(kid) = jwk.kid.filter(|k| !k.is_empty()) else {
            debug!("skipping JWKS entry without kid");
            continue;
        };
        let algorithm = match jwk.alg.as_deref() {
            Some(alg) => match alg.parse::<Algorithm>() {
                Ok(a) => a,
                Err(_) => {
                    debug!(kid = %kid, alg, "skipping JWKS entry with unknown algorithm");
                    continue;
                }
            },
            // Kubernetes issuers publish RSA keys and may omit alg
            None if jwk.kty.eq_ignore_ascii_case("RSA") => Algorithm::RS256,
            None => {
                debug!(kid = %kid, kty = %jwk.kty, "skipping JWKS entry without algorithm");
                continue;
            }
        };

        let decoding = if jwk.kty.eq_ignore_ascii_case("RSA")
            && matches!(algorithm, Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512)
        {
            let (Some(n), Some(e)) = (jwk.n.as_deref(), jwk.e.as_deref()) else {
                debug!(kid = %kid, "skipping RSA JWKS entry without modulus/exponent");
                continue;
            };
            match DecodingKey::from_rsa_components(n, e) {
                Ok(dk) => dk,
                Err(err) => {
                    debug!(kid = %kid, error = %err, "skipping unparseable RSA JWKS entry");
                    continue;
                }
            }
        } else if jwk.kty.eq_ignore_ascii_case("oct")
            && matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
        {
            let Some(k) = jwk.k.as_deref() else {
                debug!(kid = %kid, "skipping oct JWKS entry without key material");
                continue;
            };
            match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(k) {
                Ok(secret) => DecodingKey::from_secret(&secret),
                Err(err) => {
                    debug!(kid = %kid, error = %err, "skipping oct JWKS entry with bad base64");
                    continue;
                }
            }
        } else {
            debug!(kid = %kid, kty = %jwk.kty, ?algorithm, "skipping unsupported JWKS entry");
            continue;
        };

        keys.insert(
            kid.clone(),
            Arc::new(VerificationKey {
                kid,
                algorithm,
                decoding,
            }),
        );
    }
    Ok(KeySet { keys })
}
