//! Authorization service
//!
//! The broker-embedded participant. Subscribes to the callout subject,
//! runs every inbound request through the pipeline (token validation,
//! identity lookup, permission derivation, response signing) and publishes
//! the reply to the request's inbox.
//!
//! The pipeline lives in [`Authorizer`], which has no broker dependency
//! and is what the test suite drives. [`AuthCalloutService`] wraps it with
//! the connection, the subscription, the per-request task spawn, and the
//! lifecycle state machine:
//!
//! ```text
//! Init → Connected → Subscribed → Running → Draining → Stopped
//! ```
//!
//! Every deny is identical on the wire: an empty reply payload. A client
//! probing the service learns nothing about why it was refused; operators
//! read the reason from logs and the labelled deny counter.

pub mod claims;
pub mod creds;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt as _;
use nkeys::KeyPair;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::DenyReason;
use crate::identity::IdentityCache;
use crate::metrics::metrics;
use crate::permissions::derive_capabilities;
use crate::token::{Clock, Principal, TokenValidator};

use claims::{decode_authorization_request, issue_user_claims, AuthorizationRequest};

/// Subject reserved by the broker's callout protocol.
pub const AUTH_CALLOUT_SUBJECT: &str = "$SYS.REQ.USER.AUTH";

/// Lifecycle of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Init,
    Connected,
    Subscribed,
    Running,
    Draining,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceState::Init => "init",
            ServiceState::Connected => "connected",
            ServiceState::Subscribed => "subscribed",
            ServiceState::Running => "running",
            ServiceState::Draining => "draining",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A successfully issued authorization.
pub struct IssuedAuthorization {
    /// Signed user-claims JWT, ready to publish as the reply payload.
    pub jwt: String,
    pub principal: Principal,
}

/// Wire payload for an authorization outcome.
///
/// An allow carries the signed user claim; every deny is the same empty
/// body regardless of category. This is the single place the mapping
/// happens, which is what keeps deny categories indistinguishable on the
/// wire.
pub fn reply_payload(outcome: &Result<IssuedAuthorization, DenyReason>) -> Vec<u8> {
    match outcome {
        Ok(issued) => issued.jwt.clone().into_bytes(),
        Err(_) => Vec::new(),
    }
}

/// Log and count one finished authorization, returning its wire payload.
pub fn complete_request(
    outcome: &Result<IssuedAuthorization, DenyReason>,
    request_id: &str,
    client_host: Option<&str>,
    elapsed: Duration,
) -> Vec<u8> {
    match outcome {
        Ok(issued) => {
            metrics().inc_allowed();
            debug!(
                request_id,
                namespace = %issued.principal.namespace,
                name = %issued.principal.name,
                elapsed_ms = elapsed.as_millis() as u64,
                "authorization allowed"
            );
        }
        Err(reason) => {
            reason.log(request_id, client_host);
            metrics().inc_denied(reason.metric_label());
        }
    }
    reply_payload(outcome)
}

/// The broker-independent authorization pipeline.
///
/// Holds shared references to the key set (through the validator) and the
/// identity cache; per-request state is all locals, so any number of
/// requests run it concurrently.
pub struct Authorizer {
    validator: Arc<TokenValidator>,
    cache: Arc<IdentityCache>,
    signing_key: Arc<KeyPair>,
    account: String,
    decision_ttl: Duration,
    clock: Clock,
}

impl Authorizer {
    pub fn new(
        validator: Arc<TokenValidator>,
        cache: Arc<IdentityCache>,
        signing_key: Arc<KeyPair>,
        account: impl Into<String>,
        decision_ttl: Duration,
    ) -> Self {
        Self {
            validator,
            cache,
            signing_key,
            account: account.into(),
            decision_ttl,
            clock: Clock::system(),
        }
    }

    /// Override the time source used for issued claims.
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Run the pipeline for one decoded request.
    pub async fn authorize(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<IssuedAuthorization, DenyReason> {
        let token = request
            .connect_opts
            .bearer_token()
            .ok_or(DenyReason::TokenMissing)?;
        let principal = self.validator.validate(token).await?;
        let profile = self
            .cache
            .resolve(&principal.namespace, &principal.name)
            .await
            .ok_or_else(|| DenyReason::IdentityNotFound {
                namespace: principal.namespace.clone(),
                name: principal.name.clone(),
            })?;
        let decision = derive_capabilities(&principal, &profile, self.decision_ttl);
        let jwt = issue_user_claims(
            &self.signing_key,
            &request.user_nkey,
            &self.account,
            &decision,
            self.clock.now(),
        )
        .map_err(|err| DenyReason::SigningFailure {
            error: err.to_string(),
        })?;
        Ok(IssuedAuthorization { jwt, principal })
    }

    /// Decode a raw request payload and run the pipeline.
    pub async fn authorize_payload(
        &self,
        payload: &[u8],
    ) -> Result<IssuedAuthorization, DenyReason> {
        let request = decode_authorization_request(payload).map_err(|err| {
            DenyReason::RequestParse {
                error: err.to_string(),
            }
        })?;
        self.authorize(&request.nats).await
    }
}

/// The connected callout participant.
pub struct AuthCalloutService {
    client: async_nats::Client,
    authorizer: Arc<Authorizer>,
    state: std::sync::Mutex<ServiceState>,
    request_seq: AtomicU64,
}

impl AuthCalloutService {
    /// Connect to the broker and authenticate with the signing key's seed.
    ///
    /// Reconnection with backoff and subscription re-establishment are the
    /// client library's job; connection events are surfaced into logs and
    /// the disconnect counter.
    pub async fn connect(
        broker_url: &str,
        signing_key: &KeyPair,
        authorizer: Arc<Authorizer>,
    ) -> anyhow::Result<Self> {
        let seed = signing_key
            .seed()
            .map_err(|err| anyhow::anyhow!("signing key has no exportable seed: {err}"))?;
        let client = async_nats::ConnectOptions::with_nkey(seed)
            .name("natsgate")
            .retry_on_initial_connect()
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Connected => {
                        info!("broker connection established");
                    }
                    async_nats::Event::Disconnected => {
                        metrics().inc_broker_disconnect();
                        warn!("broker connection lost, reconnecting");
                    }
                    other => debug!(event = %other, "broker connection event"),
                }
            })
            .connect(broker_url)
            .await?;

        let service = Self {
            client,
            authorizer,
            state: std::sync::Mutex::new(ServiceState::Init),
            request_seq: AtomicU64::new(0),
        };
        service.transition(ServiceState::Connected);
        Ok(service)
    }

    fn transition(&self, to: ServiceState) {
        let mut state = self.state.lock().expect("service state lock poisoned");
        info!(from = %*state, to = %to, "service state transition");
        *state = to;
    }

    pub fn state(&self) -> ServiceState {
        *self.state.lock().expect("service state lock poisoned")
    }

    /// Serve authorization requests until the shutdown flag flips.
    ///
    /// Each request is handled in its own task; parallelism is bounded by
    /// the client library's dispatcher. On shutdown the subscription is
    /// torn down first (no new requests), then in-flight handlers are
    /// awaited, then the connection is flushed.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut subscriber = self.client.subscribe(AUTH_CALLOUT_SUBJECT).await?;
        self.transition(ServiceState::Subscribed);
        self.client.flush().await?;
        self.transition(ServiceState::Running);

        let mut handlers: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.transition(ServiceState::Draining);
                    if let Err(err) = subscriber.unsubscribe().await {
                        debug!(error = %err, "unsubscribe during drain failed");
                    }
                    break;
                }
                message = subscriber.next() => match message {
                    Some(message) => {
                        let service = Arc::clone(&self);
                        handlers.spawn(async move {
                            service.handle_message(message).await;
                        });
                    }
                    None => {
                        warn!("authorization subscription ended");
                        break;
                    }
                },
                // reap completed handlers as we go
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        while handlers.join_next().await.is_some() {}
        if let Err(err) = self.client.flush().await {
            debug!(error = %err, "flush during shutdown failed");
        }
        self.transition(ServiceState::Stopped);
        Ok(())
    }

    async fn handle_message(&self, message: async_nats::Message) {
        let Some(reply) = message.reply else {
            warn!(subject = %message.subject, "authorization request without reply inbox, dropping");
            return;
        };
        let started = Instant::now();

        let (outcome, request_id, client_host) =
            match decode_authorization_request(&message.payload) {
                Ok(request) => {
                    let request_id = request
                        .jti
                        .clone()
                        .unwrap_or_else(|| self.next_request_id());
                    let client_host = request.nats.client_info.host.clone();
                    (
                        self.authorizer.authorize(&request.nats).await,
                        request_id,
                        client_host,
                    )
                }
                Err(err) => (
                    Err(DenyReason::RequestParse {
                        error: err.to_string(),
                    }),
                    self.next_request_id(),
                    None,
                ),
            };

        let payload = complete_request(
            &outcome,
            &request_id,
            client_host.as_deref(),
            started.elapsed(),
        );

        if let Err(err) = self.client.publish(reply, payload.into()).await {
            warn!(request_id, error = %err, "failed to publish authorization reply");
        }
    }

    fn next_request_id(&self) -> String {
        format!("req-{}", self.request_seq.fetch_add(1, Ordering::Relaxed))
    }
}
