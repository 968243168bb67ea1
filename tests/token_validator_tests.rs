//! Token validator behavior against the deny taxonomy
//!
//! Each test feeds one malformed or off-spec token through the validator
//! and asserts the precise deny category that comes back. Tokens are
//! signed with HS256 test fixtures; the key set is file-backed.

mod common;

use std::time::Duration;

use common::*;
use natsgate::error::DenyReason;
use serde_json::json;
use tempfile::TempDir;

use natsgate::keyset::KeySetResolver;
use std::sync::Arc;

async fn default_resolver(dir: &TempDir) -> Arc<KeySetResolver> {
    let path = dir.path().join("jwks.json");
    std::fs::write(&path, oct_jwks(&[(KID, SECRET)])).unwrap();
    primed_file_resolver(path, Duration::from_secs(3600)).await
}

#[tokio::test]
async fn valid_token_yields_principal() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let principal = validator
        .validate(&workload_token("default", "service-a"))
        .await
        .unwrap();
    assert_eq!(principal.namespace, "default");
    assert_eq!(principal.name, "service-a");
    assert_eq!(principal.issuer, ISSUER);
    assert!(principal.audiences.iter().any(|a| a == AUDIENCE));
    assert_eq!(principal.expires_at, NOW + 3600);
    assert_eq!(principal.issued_at, NOW - 10);
    assert!(principal.expires_at > principal.not_before);
}

#[tokio::test]
async fn audience_list_containing_expected_is_accepted() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let mut claims = base_claims("default", "service-a");
    claims["aud"] = json!(["https://kubernetes.default.svc", AUDIENCE]);
    let principal = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap();
    assert_eq!(principal.audiences.len(), 2);
}

#[tokio::test]
async fn expired_token_is_token_expired() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let mut claims = base_claims("default", "service-a");
    claims["exp"] = json!(NOW - 5);
    let reason = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap_err();
    assert!(matches!(reason, DenyReason::Expired { exp, now } if exp == NOW - 5 && now == NOW));
    assert_eq!(reason.metric_label(), "token-expired");
}

#[tokio::test]
async fn wrong_audience_is_token_audience() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let mut claims = base_claims("default", "service-a");
    claims["aud"] = json!("wrong");
    let reason = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap_err();
    assert_eq!(reason, DenyReason::WrongAudience);
    assert_eq!(reason.metric_label(), "token-audience");
}

#[tokio::test]
async fn wrong_issuer_is_token_issuer() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let mut claims = base_claims("default", "service-a");
    claims["iss"] = json!("https://sts.example.com");
    let reason = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap_err();
    assert!(
        matches!(&reason, DenyReason::WrongIssuer { got: Some(got) } if got == "https://sts.example.com")
    );
}

#[tokio::test]
async fn issuer_is_checked_before_audience() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    // both wrong: the issuer failure must win
    let mut claims = base_claims("default", "service-a");
    claims["iss"] = json!("https://sts.example.com");
    claims["aud"] = json!("wrong");
    let reason = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap_err();
    assert_eq!(reason.metric_label(), "token-issuer");
}

#[tokio::test]
async fn future_nbf_is_not_yet_valid() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let mut claims = base_claims("default", "service-a");
    claims["nbf"] = json!(NOW + 600);
    let reason = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap_err();
    assert!(matches!(reason, DenyReason::NotYetValid { claim: "nbf", .. }));
}

#[tokio::test]
async fn iat_beyond_skew_is_rejected_within_skew_accepted() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    // 30 s ahead is inside the default 60 s skew
    let mut claims = base_claims("default", "service-a");
    claims["iat"] = json!(NOW + 30);
    claims["nbf"] = json!(NOW - 10);
    assert!(validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .is_ok());

    let mut claims = base_claims("default", "service-a");
    claims["iat"] = json!(NOW + 120);
    claims["nbf"] = json!(NOW - 10);
    let reason = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap_err();
    assert!(matches!(reason, DenyReason::NotYetValid { claim: "iat", .. }));
}

#[tokio::test]
async fn missing_platform_claims_are_rejected() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let mut claims = base_claims("default", "service-a");
    claims.as_object_mut().unwrap().remove("kubernetes.io");
    let reason = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap_err();
    assert_eq!(reason, DenyReason::MissingPlatformClaims);

    let mut claims = base_claims("default", "service-a");
    claims["kubernetes.io"]["namespace"] = json!("");
    let reason = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap_err();
    assert_eq!(reason, DenyReason::MissingPlatformClaims);

    let mut claims = base_claims("default", "service-a");
    claims["kubernetes.io"]["serviceaccount"]["name"] = json!("");
    let reason = validator
        .validate(&signed_token(SECRET, KID, &claims))
        .await
        .unwrap_err();
    assert_eq!(reason, DenyReason::MissingPlatformClaims);
}

#[tokio::test]
async fn unknown_kid_is_keyset_unavailable() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let token = signed_token(SECRET, "rotated-away", &base_claims("default", "service-a"));
    let reason = validator.validate(&token).await.unwrap_err();
    assert!(matches!(&reason, DenyReason::UnknownKey { kid } if kid == "rotated-away"));
    assert_eq!(reason.metric_label(), "keyset-unavailable");
}

#[tokio::test]
async fn tampered_signature_is_token_signature() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let token = signed_token(b"some-other-secret", KID, &base_claims("default", "service-a"));
    let reason = validator.validate(&token).await.unwrap_err();
    assert_eq!(reason, DenyReason::BadSignature);
    assert_eq!(reason.metric_label(), "token-signature");
}

#[tokio::test]
async fn disallowed_algorithm_is_rejected_before_key_lookup() {
    let dir = TempDir::new().unwrap();
    // allow list is RS256-only here, so an HS256 token must be refused
    let resolver = default_resolver(&dir).await;
    let validator = natsgate::token::TokenValidator::new(resolver, ISSUER, AUDIENCE)
        .clock(natsgate::token::Clock::fixed(NOW));

    let token = workload_token("default", "service-a");
    let reason = validator.validate(&token).await.unwrap_err();
    assert_eq!(reason.metric_label(), "token-parse");
}

#[tokio::test]
async fn garbage_is_token_parse() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    for garbage in ["", "not-a-jwt", "a.b", "a.b.c.d"] {
        let reason = validator.validate(garbage).await.unwrap_err();
        assert_eq!(reason.metric_label(), "token-parse", "input: {garbage:?}");
    }
}

#[tokio::test]
async fn missing_kid_is_token_parse() {
    let dir = TempDir::new().unwrap();
    let validator = test_validator(default_resolver(&dir).await);

    let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
    let key = jsonwebtoken::EncodingKey::from_secret(SECRET);
    let token =
        jsonwebtoken::encode(&header, &base_claims("default", "service-a"), &key).unwrap();
    let reason = validator.validate(&token).await.unwrap_err();
    assert_eq!(reason.metric_label(), "token-parse");
}
