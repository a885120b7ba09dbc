//! Typed request conditions used by policies.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::ant::AntPattern;
use crate::error::{RatewardenError, Result};
use crate::request::{IdentityResolver, RequestDescriptor, Route};

/// Separator between a kind and its matcher in configuration strings.
const MATCHER_DELIMITER: char = '=';

/// The dimension of a request a [`MatchType`] inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// Client address, optionally a CIDR block
    Origin,
    /// Authenticated user
    User,
    /// Path prefix of the matched route
    RoutePath,
    /// Role held by the authenticated user
    Role,
    /// HTTP method
    HttpMethod,
    /// Ant-style pattern over the request path
    UrlPattern,
}

impl MatchKind {
    /// Kinds that are meaningless without a matcher.
    pub fn is_matcher_required(&self) -> bool {
        matches!(self, MatchKind::Role | MatchKind::UrlPattern)
    }

    /// Canonical configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Origin => "origin",
            MatchKind::User => "user",
            MatchKind::RoutePath => "url",
            MatchKind::Role => "role",
            MatchKind::HttpMethod => "http_method",
            MatchKind::UrlPattern => "url_pattern",
        }
    }
}

impl FromStr for MatchKind {
    type Err = RatewardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "origin" => Ok(MatchKind::Origin),
            "user" => Ok(MatchKind::User),
            "url" | "route_path" => Ok(MatchKind::RoutePath),
            "role" => Ok(MatchKind::Role),
            "http_method" | "httpmethod" => Ok(MatchKind::HttpMethod),
            "url_pattern" => Ok(MatchKind::UrlPattern),
            other => Err(RatewardenError::Config(format!("Unknown match type '{}'", other))),
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One condition of a policy: a kind plus an optional literal matcher.
///
/// Configured as `"<kind>"` or `"<kind>=<matcher>"`, e.g. `"user=alice"`,
/// `"origin=10.0.0.0/8"` or `"url_pattern=/api/**"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MatchType {
    kind: MatchKind,
    matcher: Option<String>,
    /// Compiled form of a `UrlPattern` matcher
    pattern: Option<AntPattern>,
}

impl MatchType {
    /// Create a match type. Empty matchers are normalized to `None`.
    pub fn new(kind: MatchKind, matcher: Option<&str>) -> Result<Self> {
        let matcher = matcher
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let pattern = match (&kind, matcher.as_deref()) {
            (MatchKind::UrlPattern, Some(m)) => Some(AntPattern::new(m)?),
            _ => None,
        };

        Ok(Self {
            kind,
            matcher,
            pattern,
        })
    }

    pub fn kind(&self) -> MatchKind {
        self.kind
    }

    pub fn matcher(&self) -> Option<&str> {
        self.matcher.as_deref()
    }

    pub fn is_matcher_required(&self) -> bool {
        self.kind.is_matcher_required()
    }

    /// Reject configurations that can never be evaluated.
    pub fn validate(&self) -> Result<()> {
        match self.matcher.as_deref() {
            None if self.is_matcher_required() => Err(RatewardenError::Config(format!(
                "Match type '{}' requires a matcher",
                self.kind
            ))),
            Some(m) if self.kind == MatchKind::Origin && m.contains('/') => m
                .parse::<IpNet>()
                .map(|_| ())
                .map_err(|e| RatewardenError::Config(format!("Invalid CIDR block '{}': {}", m, e))),
            _ => Ok(()),
        }
    }

    /// Check whether the request satisfies this condition.
    ///
    /// A match type without a matcher applies to every request.
    pub fn matches(
        &self,
        request: &RequestDescriptor,
        route: Option<&Route>,
        identity: &IdentityResolver,
    ) -> bool {
        let Some(matcher) = self.matcher.as_deref() else {
            return true;
        };

        match self.kind {
            MatchKind::Origin => {
                let address = identity.remote_address(request);
                if matcher.contains('/') {
                    match (matcher.parse::<IpNet>(), address.parse::<IpAddr>()) {
                        (Ok(network), Ok(ip)) => network.contains(&ip),
                        _ => false,
                    }
                } else {
                    matcher == address
                }
            }
            MatchKind::User => matcher == identity.user(request),
            MatchKind::RoutePath => route.map_or(true, |r| r.path.starts_with(matcher)),
            MatchKind::Role => identity.has_role(request, matcher),
            MatchKind::HttpMethod => request.method.eq_ignore_ascii_case(matcher),
            MatchKind::UrlPattern => self
                .pattern
                .as_ref()
                .is_some_and(|pattern| pattern.matches(&request.path)),
        }
    }

    /// The value this condition contributes to a counting key.
    pub fn key_fragment(
        &self,
        request: &RequestDescriptor,
        route: Option<&Route>,
        identity: &IdentityResolver,
    ) -> String {
        let base = match self.kind {
            MatchKind::Origin => identity.remote_address(request).to_string(),
            MatchKind::User => identity.user(request).to_string(),
            MatchKind::RoutePath => route.map(|r| r.path.clone()).unwrap_or_default(),
            MatchKind::Role | MatchKind::UrlPattern => {
                self.matcher.clone().unwrap_or_default()
            }
            MatchKind::HttpMethod => request.method.clone(),
        };

        match self.matcher.as_deref() {
            Some(matcher) => format!("{}:{}", base, matcher),
            None => base,
        }
    }
}

impl PartialEq for MatchType {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.matcher == other.matcher
    }
}

impl Eq for MatchType {}

impl FromStr for MatchType {
    type Err = RatewardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(MATCHER_DELIMITER) {
            Some((kind, matcher)) => MatchType::new(kind.parse()?, Some(matcher)),
            None => MatchType::new(s.parse()?, None),
        }
    }
}

impl TryFrom<String> for MatchType {
    type Error = RatewardenError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MatchType> for String {
    fn from(value: MatchType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            Some(m) => write!(f, "{}{}{}", self.kind, MATCHER_DELIMITER, m),
            None => write!(f, "{}", self.kind),
        }
    }
}
