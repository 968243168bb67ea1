//! Bearer token validation
//!
//! Turns the compact serialized token a client presented into a
//! [`Principal`], or a precise [`DenyReason`]. Signature verification is
//! delegated to `jsonwebtoken` against a key resolved from the
//! [`KeySetResolver`]; claim checks are then applied manually, in a fixed
//! order, so the first failure names exactly what was wrong:
//!
//! 1. issuer, 2. audience, 3. expiry, 4. not-before, 5. issued-at skew,
//! 6. platform namespace, 7. platform identity name.
//!
//! The platform claims are the `kubernetes.io` claim object projected
//! ServiceAccount tokens carry.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::Algorithm;
use serde::Deserialize;

use crate::error::DenyReason;
use crate::keyset::KeySetResolver;

/// Default allowed signature algorithms: the platform issuer signs with
/// RSA + SHA-256.
pub const DEFAULT_ALLOWED_ALGORITHMS: &[Algorithm] = &[Algorithm::RS256];

/// Default tolerated clock skew for `iat`.
pub const DEFAULT_IAT_SKEW: Duration = Duration::from_secs(60);

/// The validated identity extracted from a token.
///
/// Request-scoped: built per authorization, consumed by the capability
/// builder, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub namespace: String,
    pub name: String,
    pub issuer: String,
    pub audiences: Vec<String>,
    pub issued_at: i64,
    pub not_before: i64,
    pub expires_at: i64,
}

/// Injectable time source (unix seconds).
///
/// Production uses [`Clock::system`]; tests pin a fixed instant to make
/// expiry and skew checks deterministic.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> i64 + Send + Sync>);

impl Clock {
    pub fn system() -> Self {
        Clock(Arc::new(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64
        }))
    }

    pub fn fixed(now: i64) -> Self {
        Clock(Arc::new(move || now))
    }

    pub fn now(&self) -> i64 {
        (self.0)()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Clock").field(&self.now()).finish()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::One(aud) => aud == expected,
            Audience::Many(auds) => auds.iter().any(|a| a == expected),
        }
    }

    fn into_vec(self) -> Vec<String> {
        match self {
            Audience::One(aud) => vec![aud],
            Audience::Many(auds) => auds,
        }
    }
}

#[derive(Deserialize)]
struct ServiceAccountClaim {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct KubernetesClaims {
    #[serde(default)]
    namespace: String,
    #[serde(rename = "serviceaccount")]
    service_account: Option<ServiceAccountClaim>,
}

#[derive(Deserialize)]
struct RawClaims {
    iss: Option<String>,
    aud: Option<Audience>,
    exp: Option<i64>,
    nbf: Option<i64>,
    iat: Option<i64>,
    #[serde(rename = "kubernetes.io")]
    kubernetes: Option<KubernetesClaims>,
}

/// Validates bearer tokens against the issuer key set and the configured
/// issuer/audience expectations.
pub struct TokenValidator {
    resolver: Arc<KeySetResolver>,
    expected_issuer: String,
    expected_audience: String,
    allowed_algorithms: Vec<Algorithm>,
    iat_skew: Duration,
    clock: Clock,
}

impl TokenValidator {
    pub fn new(
        resolver: Arc<KeySetResolver>,
        expected_issuer: impl Into<String>,
        expected_audience: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            expected_issuer: expected_issuer.into(),
            expected_audience: expected_audience.into(),
            allowed_algorithms: DEFAULT_ALLOWED_ALGORITHMS.to_vec(),
            iat_skew: DEFAULT_IAT_SKEW,
            clock: Clock::system(),
        }
    }

    /// Override the signature algorithm allow list.
    pub fn allowed_algorithms(mut self, algorithms: &[Algorithm]) -> Self {
        self.allowed_algorithms = algorithms.to_vec();
        self
    }

    /// Override the tolerated `iat` clock skew.
    pub fn iat_skew(mut self, skew: Duration) -> Self {
        self.iat_skew = skew;
        self
    }

    /// Override the time source.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Validate a token and extract the [`Principal`].
    ///
    /// May suspend on the key-set lookup when the token names an unknown
    /// `kid` (one on-demand refresh, rate-limited).
    pub async fn validate(&self, token: &str) -> Result<Principal, DenyReason> {
        let header = jsonwebtoken::decode_header(token).map_err(|e| DenyReason::TokenParse {
            error: format!("{:?}", e.kind()),
        })?;

        if !self.allowed_algorithms.contains(&header.alg) {
            return Err(DenyReason::TokenParse {
                error: format!("algorithm {:?} not in allow list", header.alg),
            });
        }
        let kid = header.kid.ok_or(DenyReason::TokenParse {
            error: "missing kid".to_string(),
        })?;

        let key = self
            .resolver
            .lookup(&kid)
            .await
            .ok_or(DenyReason::UnknownKey { kid: kid.clone() })?;
        if key.algorithm != header.alg {
            return Err(DenyReason::TokenParse {
                error: format!(
                    "token algorithm {:?} does not match key algorithm {:?}",
                    header.alg, key.algorithm
                ),
            });
        }

        // Signature only; claim checks run below in spec order so each
        // failure maps to its own deny category.
        let mut verification = jsonwebtoken::Validation::new(header.alg);
        verification.validate_exp = false;
        verification.validate_nbf = false;
        verification.validate_aud = false;
        verification.set_required_spec_claims::<&str>(&[]);

        let data = jsonwebtoken::decode::<RawClaims>(token, &key.decoding, &verification)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::InvalidSignature => DenyReason::BadSignature,
                kind => DenyReason::TokenParse {
                    error: format!("{:?}", kind),
                },
            })?;
        let claims = data.claims;
        let now = self.clock.now();

        let issuer = match claims.iss {
            Some(iss) if iss == self.expected_issuer => iss,
            other => return Err(DenyReason::WrongIssuer { got: other }),
        };

        let audiences = match claims.aud {
            Some(aud) if aud.contains(&self.expected_audience) => aud.into_vec(),
            _ => return Err(DenyReason::WrongAudience),
        };

        let expires_at = claims.exp.ok_or(DenyReason::TokenParse {
            error: "missing exp".to_string(),
        })?;
        if expires_at <= now {
            return Err(DenyReason::Expired {
                exp: expires_at,
                now,
            });
        }

        if let Some(nbf) = claims.nbf {
            if nbf > now {
                return Err(DenyReason::NotYetValid {
                    claim: "nbf",
                    value: nbf,
                    now,
                });
            }
        }
        if let Some(iat) = claims.iat {
            if iat > now + self.iat_skew.as_secs() as i64 {
                return Err(DenyReason::NotYetValid {
                    claim: "iat",
                    value: iat,
                    now,
                });
            }
        }

        let kubernetes = claims
            .kubernetes
            .ok_or(DenyReason::MissingPlatformClaims)?;
        let namespace = kubernetes.namespace;
        let name = kubernetes
            .service_account
            .map(|sa| sa.name)
            .unwrap_or_default();
        if namespace.is_empty() || name.is_empty() {
            return Err(DenyReason::MissingPlatformClaims);
        }

        let issued_at = claims.iat.unwrap_or(now);
        Ok(Principal {
            namespace,
            name,
            issuer,
            audiences,
            issued_at,
            not_before: claims.nbf.unwrap_or(issued_at),
            expires_at,
        })
    }
}
