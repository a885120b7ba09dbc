//! Selection of the policies that apply to a request.

use tracing::trace;

use super::rules::Policy;
use crate::request::{IdentityResolver, RequestDescriptor, Route};

/// Check whether every condition of `policy` holds for the request.
///
/// A policy without conditions matches every request.
pub fn is_full_match(
    policy: &Policy,
    request: &RequestDescriptor,
    route: Option<&Route>,
    identity: &IdentityResolver,
) -> bool {
    policy
        .match_types
        .iter()
        .all(|match_type| match_type.matches(request, route, identity))
}

/// Filter `policies` down to those that apply, preserving order.
///
/// Once a policy with `break_on_match` fully matches, it is still included
/// but every later policy is excluded. An empty result means the request is
/// not rate limited.
pub fn applicable_policies<'a>(
    policies: &'a [Policy],
    request: &RequestDescriptor,
    route: Option<&Route>,
    identity: &IdentityResolver,
) -> Vec<&'a Policy> {
    let mut already_broken = false;
    let mut applicable = Vec::new();

    for (index, policy) in policies.iter().enumerate() {
        let full_match = is_full_match(policy, request, route, identity);

        if full_match && !already_broken {
            applicable.push(policy);
        }
        if policy.break_on_match && full_match {
            if !already_broken {
                trace!(index, "Policy breaks evaluation of later policies");
            }
            already_broken = true;
        }
    }

    applicable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MatchType;

    fn match_type(spec: &str) -> MatchType {
        spec.parse().unwrap()
    }

    fn request() -> RequestDescriptor {
        RequestDescriptor::new("10.0.0.1", "GET", "/api/items").with_user("alice")
    }

    fn select<'a>(policies: &'a [Policy]) -> Vec<&'a Policy> {
        applicable_policies(policies, &request(), None, &IdentityResolver::default())
    }

    #[test]
    fn test_empty_match_types_match_everything() {
        let policies = vec![Policy::with_limit(1, 60)];
        assert_eq!(select(&policies).len(), 1);
    }

    #[test]
    fn test_all_match_types_must_hold() {
        let policies = vec![
            Policy::with_limit(1, 60)
                .matching(match_type("user=alice"))
                .matching(match_type("http_method=get")),
            Policy::with_limit(2, 60)
                .matching(match_type("user=alice"))
                .matching(match_type("http_method=post")),
        ];

        let selected = select(&policies);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].limit, Some(1));
    }

    #[test]
    fn test_break_on_match_excludes_later_policies() {
        let policies = vec![
            Policy::with_limit(1, 60)
                .break_on_match(true)
                .matching(match_type("user=alice")),
            Policy::with_limit(2, 60),
        ];

        let selected = select(&policies);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].limit, Some(1));
    }

    #[test]
    fn test_break_on_match_only_when_fully_matched() {
        let policies = vec![
            Policy::with_limit(1, 60)
                .break_on_match(true)
                .matching(match_type("user=bob")),
            Policy::with_limit(2, 60),
        ];

        let selected = select(&policies);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].limit, Some(2));
    }

    #[test]
    fn test_policies_before_break_are_kept() {
        let policies = vec![
            Policy::with_limit(1, 60),
            Policy::with_limit(2, 60).break_on_match(true),
            Policy::with_limit(3, 60),
            Policy::with_limit(4, 60).break_on_match(true),
        ];

        let limits: Vec<_> = select(&policies).iter().map(|p| p.limit).collect();
        assert_eq!(limits, vec![Some(1), Some(2)]);
    }

    #[test]
    fn test_no_match_yields_empty_result() {
        let policies = vec![Policy::with_limit(1, 60).matching(match_type("user=bob"))];
        assert!(select(&policies).is_empty());
    }
}
