//! Request facts consumed by the matcher and the key generator.
//!
//! Nothing here authenticates or routes anything. The caller resolves the
//! transport address, user, roles and route before the engine sees a request.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// User reported when a request carries no authenticated identity.
pub const ANONYMOUS_USER: &str = "anonymous";

/// A single inbound request as seen by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    /// Transport-level remote address
    pub remote_addr: String,
    /// Raw value of the forwarded-for header, if any
    #[serde(default)]
    pub forwarded_for: Option<String>,
    /// Authenticated user id
    #[serde(default)]
    pub user: Option<String>,
    /// Roles granted to the authenticated user
    #[serde(default)]
    pub roles: HashSet<String>,
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
}

impl RequestDescriptor {
    /// Create a descriptor for an anonymous request.
    pub fn new(remote_addr: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }
}

/// The gateway route a request was matched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Route identifier, used to select per-route policies
    pub id: String,
    /// Path prefix served by the route
    pub path: String,
}

impl Route {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }
}

/// Resolves the identity facts of a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver {
    behind_proxy: bool,
}

impl IdentityResolver {
    pub fn new(behind_proxy: bool) -> Self {
        Self { behind_proxy }
    }

    /// The client address, honoring the forwarded-for header only when the
    /// gateway is configured to sit behind a trusted proxy.
    pub fn remote_address<'a>(&self, request: &'a RequestDescriptor) -> &'a str {
        if self.behind_proxy {
            if let Some(forwarded) = request.forwarded_for.as_deref() {
                if let Some(first) = forwarded.split(',').next() {
                    return first.trim();
                }
            }
        }
        &request.remote_addr
    }

    /// The authenticated user, or [`ANONYMOUS_USER`].
    pub fn user<'a>(&self, request: &'a RequestDescriptor) -> &'a str {
        request.user.as_deref().unwrap_or(ANONYMOUS_USER)
    }

    /// Case-insensitive role membership.
    pub fn has_role(&self, request: &RequestDescriptor, role: &str) -> bool {
        request.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_address_ignores_header_without_proxy() {
        let request = RequestDescriptor::new("10.0.0.5", "GET", "/")
            .with_forwarded_for("203.0.113.7, 10.0.0.1");

        assert_eq!(IdentityResolver::new(false).remote_address(&request), "10.0.0.5");
    }

    #[test]
    fn test_remote_address_behind_proxy_uses_first_hop() {
        let request = RequestDescriptor::new("10.0.0.5", "GET", "/")
            .with_forwarded_for(" 203.0.113.7 , 10.0.0.1");

        assert_eq!(IdentityResolver::new(true).remote_address(&request), "203.0.113.7");
    }

    #[test]
    fn test_remote_address_behind_proxy_without_header() {
        let request = RequestDescriptor::new("10.0.0.5", "GET", "/");
        assert_eq!(IdentityResolver::new(true).remote_address(&request), "10.0.0.5");
    }

    #[test]
    fn test_user_falls_back_to_anonymous() {
        let resolver = IdentityResolver::default();
        let request = RequestDescriptor::new("10.0.0.5", "GET", "/");
        assert_eq!(resolver.user(&request), ANONYMOUS_USER);
        assert_eq!(resolver.user(&request.with_user("alice")), "alice");
    }

    #[test]
    fn test_has_role_is_case_insensitive() {
        let resolver = IdentityResolver::default();
        let request = RequestDescriptor::new("10.0.0.5", "GET", "/").with_role("ADMIN");
        assert!(resolver.has_role(&request, "admin"));
        assert!(!resolver.has_role(&request, "user"));
    }
}
