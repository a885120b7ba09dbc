//! Counting key generation.

use crate::policy::Policy;
use crate::request::{IdentityResolver, RequestDescriptor, Route};

/// Separator between key parts.
pub const KEY_SEPARATOR: &str = ":";
/// Stands in for the route id of requests that matched no route.
pub const NO_ROUTE: &str = "no-route";

/// Builds the key a policy counts a request under.
///
/// Both phases of one request must produce the same key, so implementations
/// have to be pure functions of their inputs.
pub trait KeyGenerator: Send + Sync {
    fn key(&self, request: &RequestDescriptor, route: Option<&Route>, policy: &Policy) -> String;
}

/// `prefix:route:fragment:fragment...`
#[derive(Debug, Clone)]
pub struct DefaultKeyGenerator {
    key_prefix: String,
    identity: IdentityResolver,
}

impl DefaultKeyGenerator {
    pub fn new(key_prefix: impl Into<String>, identity: IdentityResolver) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            identity,
        }
    }
}

impl KeyGenerator for DefaultKeyGenerator {
    fn key(&self, request: &RequestDescriptor, route: Option<&Route>, policy: &Policy) -> String {
        let route_id = route.map(|r| r.id.as_str()).unwrap_or(NO_ROUTE);

        let mut parts = Vec::with_capacity(policy.match_types.len() + 2);
        parts.push(self.key_prefix.clone());
        parts.push(route_id.to_string());
        parts.extend(
            policy
                .match_types
                .iter()
                .map(|match_type| match_type.key_fragment(request, route, &self.identity)),
        );

        parts.join(KEY_SEPARATOR)
    }
}
