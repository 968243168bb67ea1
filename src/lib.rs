//! # NATSGate
//!
//! **NATSGate** is a [NATS auth callout](https://docs.nats.io/running-a-nats-service/configuration/securing_nats/auth_callout)
//! service that binds Kubernetes workload identities to NATS publish/subscribe
//! permissions.
//!
//! ## Overview
//!
//! Workloads connect to NATS presenting their projected ServiceAccount token
//! (an OIDC JWT minted by the cluster). The broker does not validate the
//! token itself; it forwards an authorization request to NATSGate and waits
//! for a signed decision. NATSGate validates the token against the cluster
//! issuer's JWKS, resolves the ServiceAccount's declared capabilities from a
//! watch-driven cache, derives the final subject permissions, and replies
//! with a user claim signed by the account's nominated callout key. Denies
//! are an empty reply, identical for every failure cause, so a probing
//! client learns nothing.
//!
//! Operators declare extra subjects per workload with two ServiceAccount
//! annotations:
//!
//! ```yaml
//! metadata:
//!   annotations:
//!     nats.io/allowed-pub-subjects: "test.>, events.>"
//!     nats.io/allowed-sub-subjects: "test.>, commands.*"
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//!
//! - **[`keyset`]** - issuer JWKS fetch, rotation, and `kid` lookup
//! - **[`token`]** - bearer token validation and principal extraction
//! - **[`identity`]** - the ServiceAccount capability cache and its watch consumer
//! - **[`permissions`]** - derivation of the final publish/subscribe lists
//! - **[`service`]** - the broker participant: request handling, claim signing, lifecycle
//! - **[`config`]** - flag/environment configuration surface
//! - **[`metrics`]** - in-process counter registry
//! - **[`error`]** - the internal deny taxonomy
//!
//! ### Authorization Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client as Workload<br/>(ServiceAccount token)
//!     participant Broker as NATS Server
//!     participant Service as AuthCalloutService
//!     participant Validator as TokenValidator
//!     participant KeySet as KeySetResolver
//!     participant Cache as IdentityCache
//!     participant Builder as permissions
//!
//!     Client->>Broker: CONNECT {jwt: <token>}
//!     Broker->>Service: $SYS.REQ.USER.AUTH<br/>(user_nkey, connect_opts)
//!     Service->>Validator: validate(token)
//!     Validator->>KeySet: lookup(kid)
//!     Note over KeySet: unknown kid triggers one<br/>rate-limited JWKS refetch
//!     KeySet-->>Validator: verification key
//!     Validator-->>Service: Principal {namespace, name}
//!     Service->>Cache: resolve(namespace, name)
//!     Note over Cache: miss falls through to a<br/>bounded platform point read
//!     Cache-->>Service: CapabilityProfile
//!     Service->>Builder: derive_capabilities(principal, profile)
//!     Builder-->>Service: publish/subscribe lists + response policy
//!     Service->>Service: sign user claim (Ed25519 nkey)
//!     Service-->>Broker: reply: signed user JWT
//!     Broker-->>Client: connection authorized (TTL-bounded)
//! ```
//!
//! The watch dataflow is independent: a background task consumes the
//! platform's ADD/UPDATE/DELETE stream over ServiceAccounts and is the
//! cache's single writer. A periodic full re-list reconciles anything a
//! dropped event left behind.
//!
//! ### Key Architectural Patterns
//!
//! 1. **Swap-and-publish key set**: each JWKS refresh publishes a complete
//!    immutable set through an `ArcSwap`; token validation never blocks on
//!    the refresher.
//! 2. **Single-writer cache**: one `RwLock` map of immutable profiles;
//!    watch events apply in arrival order per key, readers clone an `Arc`.
//! 3. **Opaque deny**: every failure category collapses to the same empty
//!    reply; diagnostics go to logs and labelled counters only.
//! 4. **One-shot response grant**: issued claims never grant `_INBOX.>`
//!    publish; replies ride a `{max_msgs: 1}` response permission, which is
//!    what makes the broad `_INBOX.>` subscribe safe between tenants.
//!
//! ## Quick Start
//!
//! ```bash
//! natsgate \
//!   --broker-url nats://nats.nats.svc:4222 \
//!   --broker-credentials-file /etc/natsgate/service.creds \
//!   --broker-account APP \
//!   --issuer-jwks-url https://kubernetes.default.svc/openid/v1/jwks \
//!   --issuer-expected-issuer https://kubernetes.default.svc
//! ```
//!
//! Every flag is also an environment variable (`BROKER_URL`, `LOG_LEVEL`,
//! ...); see [`config::Config`].

pub mod config;
pub mod error;
pub mod identity;
pub mod keyset;
pub mod metrics;
pub mod permissions;
pub mod service;
pub mod token;

pub use config::Config;
pub use error::DenyReason;
pub use identity::{CapabilityProfile, IdentityCache};
pub use keyset::{KeySetResolver, KeySetSource};
pub use permissions::{derive_capabilities, CapabilityDecision};
pub use service::{AuthCalloutService, Authorizer, AUTH_CALLOUT_SUBJECT};
pub use token::{Principal, TokenValidator};
