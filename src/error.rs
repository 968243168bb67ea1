//! Deny taxonomy for authorization requests
//!
//! Every way a single authorization request can fail is enumerated here.
//! The enum is internal only: on the wire all variants collapse to the same
//! opaque deny (an empty reply), so a connecting client cannot distinguish
//! a bad signature from an unknown identity. The detail lives in structured
//! logs and in the labelled deny counter.

use tracing::{debug, warn};

/// Reason an authorization request was denied.
///
/// Carried from the failing pipeline stage back to the service handler,
/// which logs it, increments the matching counter, and replies with the
/// single opaque deny. Variants hold just enough context to make the log
/// line actionable for an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The authorization request payload itself could not be decoded
    RequestParse { error: String },
    /// Connect options carried neither a `jwt` nor a `token` field
    TokenMissing,
    /// Token header or claims segment could not be parsed, or the
    /// algorithm is outside the allow list
    TokenParse { error: String },
    /// Token `kid` is not in the key set, even after an on-demand refresh
    UnknownKey { kid: String },
    /// Signature did not verify against the resolved key
    BadSignature,
    /// `exp` is in the past
    Expired { exp: i64, now: i64 },
    /// `nbf` is in the future, or `iat` is further in the future than the
    /// configured skew
    NotYetValid { claim: &'static str, value: i64, now: i64 },
    /// `iss` does not match the expected issuer
    WrongIssuer { got: Option<String> },
    /// `aud` does not contain the expected audience
    WrongAudience,
    /// The platform identity claims are absent or empty
    MissingPlatformClaims,
    /// Token validated but no capability profile is known for the identity
    IdentityNotFound { namespace: String, name: String },
    /// The user claim document could not be signed
    SigningFailure { error: String },
}

impl DenyReason {
    /// Label used for the `deny_total` counter.
    pub fn metric_label(&self) -> &'static str {
        match self {
            DenyReason::RequestParse { .. } => "request-parse",
            DenyReason::TokenMissing => "token-missing",
            DenyReason::TokenParse { .. } => "token-parse",
            DenyReason::UnknownKey { .. } => "keyset-unavailable",
            DenyReason::BadSignature => "token-signature",
            DenyReason::Expired { .. } => "token-expired",
            DenyReason::NotYetValid { .. } => "token-not-yet-valid",
            DenyReason::WrongIssuer { .. } => "token-issuer",
            DenyReason::WrongAudience => "token-audience",
            DenyReason::MissingPlatformClaims => "token-missing-platform-claims",
            DenyReason::IdentityNotFound { .. } => "identity-not-found",
            DenyReason::SigningFailure { .. } => "signing-failure",
        }
    }

    /// Log the deny with structured fields.
    ///
    /// Expected-traffic failures (expired tokens, unknown identities) log at
    /// DEBUG; failures that point at misconfiguration or an active problem
    /// log at WARN. Nothing logged here is ever echoed to the client.
    pub fn log(&self, request_id: &str, client_host: Option<&str>) {
        let host = client_host.unwrap_or("-");
        match self {
            DenyReason::RequestParse { error } => {
                warn!(request_id, host, error = %error, "authorization denied: malformed request");
            }
            DenyReason::TokenMissing => {
                debug!(request_id, host, "authorization denied: no bearer token presented");
            }
            DenyReason::TokenParse { error } => {
                debug!(request_id, host, error = %error, "authorization denied: token unparseable");
            }
            DenyReason::UnknownKey { kid } => {
                warn!(request_id, host, kid = %kid, "authorization denied: no verification key for kid");
            }
            DenyReason::BadSignature => {
                warn!(request_id, host, "authorization denied: token signature invalid");
            }
            DenyReason::Expired { exp, now } => {
                debug!(request_id, host, exp, now, "authorization denied: token expired");
            }
            DenyReason::NotYetValid { claim, value, now } => {
                debug!(request_id, host, claim, value, now, "authorization denied: token not yet valid");
            }
            DenyReason::WrongIssuer { got } => {
                warn!(request_id, host, got = got.as_deref().unwrap_or("-"), "authorization denied: unexpected issuer");
            }
            DenyReason::WrongAudience => {
                warn!(request_id, host, "authorization denied: audience mismatch");
            }
            DenyReason::MissingPlatformClaims => {
                warn!(request_id, host, "authorization denied: workload identity claims missing");
            }
            DenyReason::IdentityNotFound { namespace, name } => {
                debug!(request_id, host, namespace = %namespace, name = %name, "authorization denied: identity has no capability profile");
            }
            DenyReason::SigningFailure { error } => {
                warn!(request_id, host, error = %error, "authorization denied: response signing failed");
            }
        }
    }
}
