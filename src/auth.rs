// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! The `AuthCapability` collaborator boundary (§4.H).
//!
//! This crate never evaluates authorization policy itself — it only ever
//! asks a boolean question of an injected capability. Resource lists with
//! MQTT-style wildcards are resolved with the same [`crate::topic`] matching
//! primitives used for cloud subscription coalescing, so "authorized to
//! publish under `a/b/+`" and "subscribed to `a/b/+`" share one notion of
//! superset.

use async_trait::async_trait;

use crate::topic::Topic;

/// Identifies the caller on whose behalf an operation is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(pub String);

/// The IPC-facing operation kind being authorized (§6 "Consumer-facing
/// operations").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PublishToIotCore,
    SubscribeToIotCore,
    PublishToTopic,
    SubscribeToTopic,
}

/// The resource (topic or filter) an operation targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource(pub String);

/// The external authorization capability (§1, §4.H): `check` answers a
/// single boolean question and never reveals *why* a request was denied,
/// matching §7's "authorization failures never reveal resource existence".
#[async_trait]
pub trait AuthCapability: Send + Sync {
    async fn check(&self, principal: &Principal, operation: Operation, resource: &Resource)
        -> bool;
}

/// An `AuthCapability` that authorizes every request. Useful for tests and
/// for embedders that perform authorization upstream of this crate.
#[derive(Debug, Default)]
pub struct AllowAll;

#[async_trait]
impl AuthCapability for AllowAll {
    async fn check(&self, _: &Principal, _: Operation, _: &Resource) -> bool {
        true
    }
}

/// A capability backed by a static allow-list of resource filters, one per
/// principal. `*` authorizes anything; any other entry is matched with the
/// same `matches`/`is_superset` relation the coalescer uses (§4.E
/// "Superset semantics and authorization").
#[derive(Debug, Default)]
pub struct AllowListCapability {
    grants: std::collections::HashMap<Principal, Vec<String>>,
}

impl AllowListCapability {
    #[must_use]
    pub fn new() -> Self {
        AllowListCapability {
            grants: std::collections::HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_grant(mut self, principal: Principal, filters: Vec<String>) -> Self {
        self.grants.insert(principal, filters);
        self
    }
}

#[async_trait]
impl AuthCapability for AllowListCapability {
    async fn check(&self, principal: &Principal, _operation: Operation, resource: &Resource) -> bool {
        let Some(filters) = self.grants.get(principal) else {
            return false;
        };
        let Ok(target) = Topic::parse_filter(&resource.0) else {
            return false;
        };
        filters.iter().any(|raw| {
            if raw == "*" {
                return true;
            }
            match Topic::parse_filter(raw) {
                Ok(grant) => grant.is_superset(&target) || grant.matches(&target),
                Err(_) => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_permits_everything() {
        let cap = AllowAll;
        let principal = Principal("device-1".to_owned());
        assert!(
            cap.check(
                &principal,
                Operation::PublishToIotCore,
                &Resource("any/topic".to_owned())
            )
            .await
        );
    }

    #[tokio::test]
    async fn wildcard_star_grant_authorizes_anything() {
        let principal = Principal("device-1".to_owned());
        let cap = AllowListCapability::new().with_grant(principal.clone(), vec!["*".to_owned()]);
        assert!(
            cap.check(
                &principal,
                Operation::SubscribeToTopic,
                &Resource("a/b/c".to_owned())
            )
            .await
        );
    }

    #[tokio::test]
    async fn single_level_wildcard_grant_authorizes_matching_topic_s6() {
        let principal = Principal("device-1".to_owned());
        let cap = AllowListCapability::new().with_grant(
            principal.clone(),
            vec!["topic/with/single/+/wildcard".to_owned()],
        );
        assert!(
            cap.check(
                &principal,
                Operation::PublishToTopic,
                &Resource("topic/with/single/abc/wildcard".to_owned())
            )
            .await
        );
        assert!(
            !cap.check(
                &principal,
                Operation::PublishToTopic,
                &Resource("topic/other".to_owned())
            )
            .await
        );
    }

    #[tokio::test]
    async fn unknown_principal_is_denied() {
        let cap = AllowListCapability::new();
        assert!(
            !cap.check(
                &Principal("stranger".to_owned()),
                Operation::PublishToTopic,
                &Resource("a".to_owned())
            )
            .await
        );
    }
}
