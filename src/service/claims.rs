//! Callout wire documents
//!
//! The broker's callout protocol is JWT in both directions:
//!
//! - **inbound**: the request payload is a JWT whose claims body carries
//!   the ephemeral user public key (`user_nkey`) and the client's connect
//!   options. Only the claims segment is decoded here; the subject the
//!   request arrived on is broker-reserved, so transport authenticity is
//!   the broker's concern, not ours.
//! - **outbound**: an allow is a NATS user-claims JWT signed with the
//!   service's Ed25519 nkey (`alg: "ed25519-nkey"`), subject bound to
//!   `user_nkey`, audience bound to the configured account. A deny is an
//!   empty payload, built nowhere near this module.

use base64::Engine as _;
use data_encoding::BASE32_NOPAD;
use nkeys::KeyPair;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::permissions::CapabilityDecision;

const JWT_HEADER: &str = r#"{"typ":"JWT","alg":"ed25519-nkey"}"#;

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

// --- inbound -------------------------------------------------------------

/// Claims body of an authorization request.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationRequestClaims {
    #[serde(default)]
    pub jti: Option<String>,
    pub nats: AuthorizationRequest,
}

/// The `nats` block of an authorization request.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationRequest {
    /// Ephemeral public key the broker minted for this connection; the
    /// issued user claim must be bound to it.
    pub user_nkey: String,
    #[serde(default)]
    pub connect_opts: ConnectOpts,
    #[serde(default)]
    pub client_info: ClientInfo,
}

/// Credentials and metadata the client presented at CONNECT.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectOpts {
    #[serde(default)]
    pub jwt: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Legacy spelling of `token` used by some client variants.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ConnectOpts {
    /// The bearer token to validate: `jwt` wins, then `token`, then the
    /// legacy `auth_token`. `None` means the client presented nothing.
    pub fn bearer_token(&self) -> Option<&str> {
        self.jwt
            .as_deref()
            .or(self.token.as_deref())
            .or(self.auth_token.as_deref())
            .filter(|t| !t.is_empty())
    }
}

/// Connection metadata, used only for log enrichment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Decode the claims body out of an authorization request payload.
pub fn decode_authorization_request(payload: &[u8]) -> anyhow::Result<AuthorizationRequestClaims> {
    let token = std::str::from_utf8(payload)?.trim();
    let mut segments = token.split('.');
    let (Some(_header), Some(claims), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        anyhow::bail!("authorization request is not a three-segment JWT");
    };
    let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(claims)?;
    Ok(serde_json::from_slice(&claims)?)
}

// --- outbound ------------------------------------------------------------

/// A NATS user-claims document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub nats: UserNats,
}

/// The `nats` block of a user claim: permissions plus claim typing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNats {
    #[serde(rename = "pub")]
    pub publish: PermissionSet,
    #[serde(rename = "sub")]
    pub subscribe: PermissionSet,
    pub resp: ResponsePermission,
    #[serde(rename = "type")]
    pub claim_type: String,
    pub version: u8,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSet {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub allow: Vec<String>,
}

/// One-shot reply grant. `ttl` is nanoseconds, zero meaning no window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePermission {
    pub max: i64,
    pub ttl: i64,
}

/// Materialize and sign the user claim for one allowed connection.
///
/// `now` is unix seconds from the service clock; expiry is `now` plus the
/// decision TTL. The `jti` is the base-32 SHA-256 of the claims document,
/// computed over the document with an empty `jti`, NATS convention.
pub fn issue_user_claims(
    signing_key: &KeyPair,
    user_nkey: &str,
    account: &str,
    decision: &CapabilityDecision,
    now: i64,
) -> anyhow::Result<String> {
    let mut claims = UserClaims {
        jti: String::new(),
        iat: now,
        exp: now + decision.ttl.as_secs() as i64,
        iss: signing_key.public_key(),
        sub: user_nkey.to_string(),
        aud: account.to_string(),
        nats: UserNats {
            publish: PermissionSet {
                allow: decision.publish.clone(),
            },
            subscribe: PermissionSet {
                allow: decision.subscribe.clone(),
            },
            resp: ResponsePermission {
                max: decision.response.max_messages,
                ttl: decision.response.expires,
            },
            claim_type: "user".to_string(),
            version: 2,
        },
    };

    let unhashed = serde_json::to_vec(&claims)?;
    claims.jti = BASE32_NOPAD.encode(&Sha256::digest(&unhashed));

    let body = serde_json::to_vec(&claims)?;
    let signing_input = format!("{}.{}", b64(JWT_HEADER.as_bytes()), b64(&body));
    let signature = signing_key
        .sign(signing_input.as_bytes())
        .map_err(|err| anyhow::anyhow!("nkey signing failed: {err}"))?;
    Ok(format!("{signing_input}.{}", b64(&signature)))
}

/// Decode a user-claims JWT without verifying its signature.
///
/// Diagnostic/test surface; the broker is the party that verifies issued
/// claims in production.
pub fn decode_user_claims(token: &str) -> anyhow::Result<UserClaims> {
    let mut segments = token.split('.');
    let (Some(_header), Some(claims), Some(_signature)) =
        (segments.next(), segments.next(), segments.next())
    else {
        anyhow::bail!("user claim is not a three-segment JWT");
    };
    let claims = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(claims)?;
    Ok(serde_json::from_slice(&claims)?)
}
