//! Shared fixtures for the integration tests
//!
//! Tokens are signed with HS256 against `oct` JWKS entries so the tests
//! need no RSA key material; the validator is configured with a matching
//! algorithm allow list. The mock JWKS server is a bare TCP listener on an
//! ephemeral port serving whatever body it is currently told to.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Read as _, Write as _};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use jsonwebtoken::Algorithm;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Value};

use natsgate::keyset::{KeySetResolver, KeySetSource};
use natsgate::token::{Clock, TokenValidator};

/// Fixed "now" for every test clock.
pub const NOW: i64 = 1_700_000_000;
pub const ISSUER: &str = "https://kubernetes.default.svc";
pub const AUDIENCE: &str = "nats";
pub const ACCOUNT: &str = "APP";
pub const KID: &str = "test-key-1";
pub const SECRET: &[u8] = b"test-secret-key-for-natsgate";

/// Build a JWKS document of symmetric keys.
pub fn oct_jwks(entries: &[(&str, &[u8])]) -> String {
    let keys: Vec<Value> = entries
        .iter()
        .map(|(kid, secret)| {
            json!({
                "kid": kid,
                "kty": "oct",
                "alg": "HS256",
                "k": base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(secret),
            })
        })
        .collect();
    json!({ "keys": keys }).to_string()
}

/// Mock JWKS endpoint: serves the current body to every request and
/// counts hits. The listener thread exits with the process.
pub struct MockJwksServer {
    pub url: String,
    body: Arc<Mutex<String>>,
    pub hits: Arc<AtomicUsize>,
}

impl MockJwksServer {
    pub fn start(initial_body: String) -> Self {
        Self::start_with_delay(initial_body, Duration::ZERO)
    }

    /// Start a server that sleeps before answering, for timeout tests.
    pub fn start_with_delay(initial_body: String, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://127.0.0.1:{}/jwks.json", addr.port());
        let body = Arc::new(Mutex::new(initial_body));
        let hits = Arc::new(AtomicUsize::new(0));

        let body_clone = Arc::clone(&body);
        let hits_clone = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                if stream.read(&mut buf).is_ok() {
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    let body = body_clone.lock().unwrap().clone();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes());
                    let _ = stream.flush();
                }
            }
        });

        thread::sleep(Duration::from_millis(50));
        MockJwksServer { url, body, hits }
    }

    pub fn set_body(&self, body: String) {
        *self.body.lock().unwrap() = body;
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Sign claims with HS256 under the given kid.
pub fn signed_token(secret: &[u8], kid: &str, claims: &Value) -> String {
    let header = jsonwebtoken::Header {
        kid: Some(kid.to_string()),
        alg: Algorithm::HS256,
        ..Default::default()
    };
    let key = jsonwebtoken::EncodingKey::from_secret(secret);
    jsonwebtoken::encode(&header, claims, &key).unwrap()
}

/// A well-formed ServiceAccount token's claims; tests mutate fields to
/// produce the failure they want.
pub fn base_claims(namespace: &str, name: &str) -> Value {
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": NOW + 3600,
        "iat": NOW - 10,
        "nbf": NOW - 10,
        "kubernetes.io": {
            "namespace": namespace,
            "serviceaccount": { "name": name, "uid": "8b3f9a0e" },
            "pod": { "name": format!("{name}-0"), "uid": "77aa91b2" }
        }
    })
}

/// Valid token for the given identity, signed under the default test kid.
pub fn workload_token(namespace: &str, name: &str) -> String {
    signed_token(SECRET, KID, &base_claims(namespace, name))
}

/// Build a ServiceAccount record with annotations.
pub fn service_account(
    namespace: &str,
    name: &str,
    resource_version: &str,
    annotations: &[(&str, &str)],
) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: Some(resource_version.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..ObjectMeta::default()
        },
        ..ServiceAccount::default()
    }
}

/// Encode an authorization request payload the way the broker does:
/// a JWT whose claims body carries `user_nkey` and `connect_opts`.
pub fn authorization_request_payload(user_nkey: &str, connect_opts: Value) -> Vec<u8> {
    let b64 = |bytes: &[u8]| base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let header = b64(br#"{"typ":"JWT","alg":"ed25519-nkey"}"#);
    let claims = json!({
        "jti": "REQTEST",
        "nats": {
            "user_nkey": user_nkey,
            "connect_opts": connect_opts,
            "client_info": { "host": "10.1.2.3", "id": 7 }
        }
    });
    let body = b64(&serde_json::to_vec(&claims).unwrap());
    format!("{header}.{body}.c2lnbmF0dXJl").into_bytes()
}

/// File-backed resolver primed from a JWKS document on disk.
pub async fn primed_file_resolver(
    path: std::path::PathBuf,
    min_refresh_gap: Duration,
) -> Arc<KeySetResolver> {
    let resolver = Arc::new(KeySetResolver::new(
        KeySetSource::File(path),
        min_refresh_gap,
        Duration::from_secs(1),
    ));
    resolver.prime().await;
    resolver
}

/// Validator wired for the HS256 test fixtures with a pinned clock.
pub fn test_validator(resolver: Arc<KeySetResolver>) -> TokenValidator {
    TokenValidator::new(resolver, ISSUER, AUDIENCE)
        .allowed_algorithms(&[Algorithm::HS256])
        .clock(Clock::fixed(NOW))
}
