//! Permission derivation
//!
//! Pure function from a validated [`Principal`] and its cached
//! [`CapabilityProfile`] to the subject lists bound into the signed user
//! claim. No I/O, no logging; output is deterministic and item order is a
//! contract:
//!
//! - publish: the namespace scope first, then the annotated extras in
//!   declared order;
//! - subscribe: the shared inbox, the identity's private inbox, the
//!   namespace scope, then the annotated extras in declared order.
//!
//! The decision never grants publish on `_INBOX.>`. Replies ride on the
//! response permission instead: one message, no expiry window, scoped by
//! the broker to the inbox of the active request. That single-shot grant is
//! what keeps the broad `_INBOX.>` subscribe safe between tenants.

use std::time::Duration;

use crate::identity::CapabilityProfile;
use crate::token::Principal;

/// Default validity window of an issued decision.
pub const DEFAULT_DECISION_TTL: Duration = Duration::from_secs(300);

/// Response permission: exactly one message, no time limit.
pub const RESPONSE_MAX_MSGS: i64 = 1;
pub const RESPONSE_EXPIRES: i64 = 0;

/// One-shot reply grant carried by every allow decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePolicy {
    pub max_messages: i64,
    pub expires: i64,
}

impl Default for ResponsePolicy {
    fn default() -> Self {
        Self {
            max_messages: RESPONSE_MAX_MSGS,
            expires: RESPONSE_EXPIRES,
        }
    }
}

/// The final authorization answer for one allowed connection.
///
/// Request-scoped; materialized into a signed user claim by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityDecision {
    pub publish: Vec<String>,
    pub subscribe: Vec<String>,
    pub response: ResponsePolicy,
    pub ttl: Duration,
}

/// Derive the subject lists for a principal from its profile.
pub fn derive_capabilities(
    principal: &Principal,
    profile: &CapabilityProfile,
    ttl: Duration,
) -> CapabilityDecision {
    let namespace = &principal.namespace;
    let name = &principal.name;

    let mut publish = Vec::with_capacity(1 + profile.additional_publish.len());
    publish.push(format!("{namespace}.>"));
    publish.extend(profile.additional_publish.iter().cloned());

    let mut subscribe = Vec::with_capacity(3 + profile.additional_subscribe.len());
    subscribe.push("_INBOX.>".to_string());
    subscribe.push(format!("_INBOX_{namespace}_{name}.>"));
    subscribe.push(format!("{namespace}.>"));
    subscribe.extend(profile.additional_subscribe.iter().cloned());

    CapabilityDecision {
        publish,
        subscribe,
        response: ResponsePolicy::default(),
        ttl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(namespace: &str, name: &str) -> Principal {
        Principal {
            namespace: namespace.to_string(),
            name: name.to_string(),
            issuer: "https://kubernetes.default.svc".to_string(),
            audiences: vec!["nats".to_string()],
            issued_at: 1_700_000_000,
            not_before: 1_700_000_000,
            expires_at: 1_700_003_600,
        }
    }

    #[test]
    fn defaults_only_when_profile_declares_nothing() {
        let profile = CapabilityProfile::new("default", "service-a", vec![], vec![]);
        let decision = derive_capabilities(
            &principal("default", "service-a"),
            &profile,
            DEFAULT_DECISION_TTL,
        );
        assert_eq!(decision.publish, vec!["default.>"]);
        assert_eq!(
            decision.subscribe,
            vec!["_INBOX.>", "_INBOX_default_service-a.>", "default.>"]
        );
        assert_eq!(decision.response.max_messages, 1);
        assert_eq!(decision.response.expires, 0);
        assert_eq!(decision.ttl, Duration::from_secs(300));
    }

    #[test]
    fn annotated_extras_follow_defaults_in_declared_order() {
        let profile = CapabilityProfile::new(
            "default",
            "service-a",
            vec!["test.>".into(), "events.>".into()],
            vec!["test.>".into(), "commands.*".into()],
        );
        let decision = derive_capabilities(
            &principal("default", "service-a"),
            &profile,
            DEFAULT_DECISION_TTL,
        );
        assert_eq!(decision.publish, vec!["default.>", "test.>", "events.>"]);
        assert_eq!(
            decision.subscribe,
            vec![
                "_INBOX.>",
                "_INBOX_default_service-a.>",
                "default.>",
                "test.>",
                "commands.*"
            ]
        );
    }

    #[test]
    fn output_is_deterministic() {
        let profile = CapabilityProfile::new(
            "prod",
            "worker",
            vec!["jobs.>".into()],
            vec!["jobs.done.*".into()],
        );
        let p = principal("prod", "worker");
        let first = derive_capabilities(&p, &profile, DEFAULT_DECISION_TTL);
        let second = derive_capabilities(&p, &profile, DEFAULT_DECISION_TTL);
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_extras_are_preserved_verbatim() {
        // duplicates are permitted and meaningless; the builder does not dedupe
        let profile = CapabilityProfile::new(
            "default",
            "svc",
            vec!["a.>".into(), "a.>".into()],
            vec![],
        );
        let decision = derive_capabilities(
            &principal("default", "svc"),
            &profile,
            DEFAULT_DECISION_TTL,
        );
        assert_eq!(decision.publish, vec!["default.>", "a.>", "a.>"]);
    }

    #[test]
    fn publish_never_contains_the_inbox_wildcard() {
        let profile = CapabilityProfile::new("default", "svc", vec!["x.>".into()], vec![]);
        let decision = derive_capabilities(
            &principal("default", "svc"),
            &profile,
            DEFAULT_DECISION_TTL,
        );
        assert!(decision.publish.iter().all(|s| !s.starts_with("_INBOX")));
    }
}
