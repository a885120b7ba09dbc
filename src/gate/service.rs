//! Two-phase rate limit gate in front of the request handler.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::context::RequestContext;
use crate::config::RateLimitSettings;
use crate::policy::{applicable_policies, Policy, PolicySet};
use crate::ratelimit::{DefaultKeyGenerator, KeyGenerator, Rate, RateLimiterBackend};
use crate::request::IdentityResolver;

/// Outcome of consuming one policy for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStatus {
    /// The counting key
    pub key: String,
    /// Request limit of the policy
    pub limit: Option<u64>,
    /// Quota of the policy in milliseconds
    pub quota_millis: Option<u64>,
    /// Rate after consuming
    pub rate: Rate,
}

impl PolicyStatus {
    pub fn is_exceeded(&self) -> bool {
        (self.limit.is_some() && self.rate.is_limit_exceeded())
            || (self.quota_millis.is_some() && self.rate.is_quota_exceeded())
    }
}

/// The request exhausted at least one applicable policy.
#[derive(Debug, Clone, Error)]
#[error("rate limit exceeded")]
pub struct RateLimitExceeded {
    /// Status of every applicable policy, exceeded or not
    pub statuses: Vec<PolicyStatus>,
}

impl RateLimitExceeded {
    /// Statuses of the policies that were exceeded.
    pub fn exceeded(&self) -> impl Iterator<Item = &PolicyStatus> {
        self.statuses.iter().filter(|s| s.is_exceeded())
    }
}

/// Admits requests before they run and charges their duration afterwards.
pub struct RateLimitGate<R: RateLimiterBackend + ?Sized> {
    enabled: bool,
    identity: IdentityResolver,
    policies: RwLock<PolicySet>,
    keys: Arc<dyn KeyGenerator>,
    limiter: Arc<R>,
}

impl<R: RateLimiterBackend + ?Sized> RateLimitGate<R> {
    /// Create a gate from settings and a backend.
    pub fn new(settings: &RateLimitSettings, limiter: Arc<R>) -> Self {
        let identity = IdentityResolver::new(settings.behind_proxy);
        Self {
            enabled: settings.enabled,
            identity,
            policies: RwLock::new(settings.policy_set()),
            keys: Arc::new(DefaultKeyGenerator::new(settings.key_prefix.clone(), identity)),
            limiter,
        }
    }

    /// Replace the key generator.
    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Swap the policy set. Requests already admitted keep the policies
    /// cached in their context.
    pub fn set_policies(&self, policies: PolicySet) {
        *self.policies.write() = policies;
        info!("Rate limit policies replaced");
    }

    /// Policies applying to the request, resolved once per context.
    pub fn applicable_policies(&self, ctx: &mut RequestContext) -> Vec<Policy> {
        if let Some(policies) = &ctx.policies {
            return policies.clone();
        }

        let set = self.policies.read();
        let selected: Vec<Policy> = applicable_policies(
            set.policies_for(ctx.route_id()),
            &ctx.request,
            ctx.route.as_ref(),
            &self.identity,
        )
        .into_iter()
        .cloned()
        .collect();
        drop(set);

        ctx.policies = Some(selected.clone());
        selected
    }

    /// Whether the request is subject to rate limiting at all.
    pub fn should_limit(&self, ctx: &mut RequestContext) -> bool {
        self.enabled && !self.applicable_policies(ctx).is_empty()
    }

    /// Phase A: consume one request from every applicable policy.
    ///
    /// Every policy is consumed even when an earlier one is already
    /// exceeded, so all counters see the request.
    pub async fn admit(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<Vec<PolicyStatus>, RateLimitExceeded> {
        if !self.should_limit(ctx) {
            ctx.admitted = true;
            return Ok(Vec::new());
        }

        let policies = self.applicable_policies(ctx);
        let statuses = self.consume_all(ctx, policies.iter(), None).await;

        if statuses.iter().any(PolicyStatus::is_exceeded) {
            ctx.exceeded = true;
            info!(
                route = ?ctx.route_id(),
                method = %ctx.request.method,
                path = %ctx.request.path,
                policies = statuses.len(),
                "Rate limit exceeded, rejecting request"
            );
            return Err(RateLimitExceeded { statuses });
        }

        ctx.admitted = true;
        debug!(
            route = ?ctx.route_id(),
            policies = statuses.len(),
            "Request admitted"
        );
        Ok(statuses)
    }

    /// Phase B: charge the request's duration to every quota policy.
    ///
    /// Does nothing for requests that were rejected or never admitted.
    pub async fn complete(&self, ctx: &RequestContext, elapsed_millis: u64) -> Vec<PolicyStatus> {
        if !self.enabled || !ctx.admitted || ctx.exceeded {
            return Vec::new();
        }

        let Some(policies) = ctx.policies.as_deref() else {
            return Vec::new();
        };
        let quota_policies = policies.iter().filter(|p| p.quota.is_some());
        let statuses = self
            .consume_all(ctx, quota_policies, Some(elapsed_millis))
            .await;

        if !statuses.is_empty() {
            debug!(
                route = ?ctx.route_id(),
                elapsed_millis,
                policies = statuses.len(),
                "Request duration charged to quota"
            );
        }
        statuses
    }

    async fn consume_all<'p>(
        &self,
        ctx: &RequestContext,
        policies: impl Iterator<Item = &'p Policy>,
        elapsed_millis: Option<u64>,
    ) -> Vec<PolicyStatus> {
        let consumptions = policies.map(|policy| {
            let key = self.keys.key(&ctx.request, ctx.route.as_ref(), policy);
            async move {
                let rate = self.limiter.consume(policy, &key, elapsed_millis).await;
                PolicyStatus {
                    key,
                    limit: policy.limit,
                    quota_millis: policy.quota_millis(),
                    rate,
                }
            }
        });

        join_all(consumptions).await
    }
}
