//! Policy configuration, request conditions and policy selection.

mod ant;
mod match_type;
mod matcher;
mod rules;

pub use ant::AntPattern;
pub use match_type::{MatchKind, MatchType};
pub use matcher::{applicable_policies, is_full_match};
pub use rules::{Policy, PolicySet, MAX_REFRESH_INTERVAL};
