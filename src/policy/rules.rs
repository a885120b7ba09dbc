//! Rate limit policies and their configuration format.
//!
//! Policies are read from YAML alongside the rest of the settings:
//!
//! ```yaml
//! default_policies:
//!   - limit: 10
//!     quota: 1
//!     refresh_interval: 60
//!     type:
//!       - user
//! policies:
//!   orders:
//!     - limit: 2
//!       break_on_match: true
//!       type:
//!         - role=admin
//!         - url_pattern=/api/orders/**
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::match_type::MatchType;
use crate::error::{RatewardenError, Result};

/// A configured rate rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Window length in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Requests allowed per window
    #[serde(default)]
    pub limit: Option<u64>,
    /// Cumulative request duration allowed per window, in seconds
    #[serde(default)]
    pub quota: Option<u64>,
    /// Suppress every later policy once this one fully matches
    #[serde(default)]
    pub break_on_match: bool,
    /// Conditions that must all hold; empty means every request
    #[serde(default, rename = "type", alias = "match_types")]
    pub match_types: Vec<MatchType>,
}

fn default_refresh_interval() -> u64 {
    60
}

/// Longest accepted window, in seconds (about 68 years).
pub const MAX_REFRESH_INTERVAL: u64 = i32::MAX as u64;

impl Default for Policy {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            limit: None,
            quota: None,
            break_on_match: false,
            match_types: Vec::new(),
        }
    }
}

impl Policy {
    /// A policy allowing `limit` requests per `refresh_interval` seconds.
    pub fn with_limit(limit: u64, refresh_interval: u64) -> Self {
        Self {
            refresh_interval,
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// A policy allowing `quota` seconds of request time per `refresh_interval` seconds.
    pub fn with_quota(quota: u64, refresh_interval: u64) -> Self {
        Self {
            refresh_interval,
            quota: Some(quota),
            ..Default::default()
        }
    }

    pub fn break_on_match(mut self, value: bool) -> Self {
        self.break_on_match = value;
        self
    }

    pub fn matching(mut self, match_type: MatchType) -> Self {
        self.match_types.push(match_type);
        self
    }

    /// Window length in milliseconds.
    pub fn refresh_interval_millis(&self) -> u64 {
        self.refresh_interval.saturating_mul(1000)
    }

    /// Quota converted to milliseconds.
    pub fn quota_millis(&self) -> Option<u64> {
        self.quota.map(|q| q.saturating_mul(1000))
    }

    /// Validate the policy before it reaches the engine.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval == 0 {
            return Err(RatewardenError::Config(
                "refresh_interval must be greater than zero".to_string(),
            ));
        }
        if self.refresh_interval > MAX_REFRESH_INTERVAL {
            return Err(RatewardenError::Config(format!(
                "refresh_interval must be at most {} seconds",
                MAX_REFRESH_INTERVAL
            )));
        }
        for match_type in &self.match_types {
            match_type.validate()?;
        }
        Ok(())
    }
}

/// The default policy list plus per-route overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    /// Policies for routes without an override
    #[serde(default)]
    pub default_policies: Vec<Policy>,
    /// Route id to policies
    #[serde(default)]
    pub policies: HashMap<String, Vec<Policy>>,
}

impl PolicySet {
    pub fn new(default_policies: Vec<Policy>) -> Self {
        Self {
            default_policies,
            policies: HashMap::new(),
        }
    }

    pub fn with_route(mut self, route_id: impl Into<String>, policies: Vec<Policy>) -> Self {
        self.policies.insert(route_id.into(), policies);
        self
    }

    /// Candidate policies for a route: its override list when one is
    /// configured, otherwise the default list.
    pub fn policies_for(&self, route_id: Option<&str>) -> &[Policy] {
        route_id
            .and_then(|id| self.policies.get(id))
            .unwrap_or(&self.default_policies)
    }

    /// Validate every configured policy.
    pub fn validate(&self) -> Result<()> {
        for policy in &self.default_policies {
            policy.validate()?;
        }
        for (route, policies) in &self.policies {
            for policy in policies {
                policy.validate().map_err(|e| {
                    RatewardenError::Config(format!("route '{}': {}", route, e))
                })?;
            }
        }
        Ok(())
    }
}
