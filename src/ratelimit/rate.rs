//! Per-key capacity state for one window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::Policy;

/// Remaining values never drop below this.
pub const EXHAUSTED: i64 = -1;

/// A view of the capacity left for one key in its current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    /// The counting key
    pub key: String,
    /// Request limit copied from the policy
    pub limit: Option<u64>,
    /// Requests left in the window; -1 once exceeded
    pub remaining: Option<i64>,
    /// Duration budget copied from the policy, in milliseconds
    pub quota_millis: Option<u64>,
    /// Duration budget left in the window, in milliseconds; -1 once exceeded
    pub remaining_quota_millis: Option<i64>,
    /// Milliseconds until the window resets
    pub reset_millis: u64,
    /// When the window ends
    pub expires_at: DateTime<Utc>,
}

impl Rate {
    /// Start a fresh window for `key` at `now`.
    pub fn new_window(policy: &Policy, key: &str, now: DateTime<Utc>) -> Self {
        let refresh_millis = policy.refresh_interval_millis();
        let quota_millis = policy.quota_millis();

        Self {
            key: key.to_string(),
            limit: policy.limit,
            remaining: policy.limit.map(saturating_i64),
            quota_millis,
            remaining_quota_millis: quota_millis.map(saturating_i64),
            reset_millis: refresh_millis,
            expires_at: add_millis(now, refresh_millis),
        }
    }

    /// Whether the window has ended at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Recompute the reset countdown from the window end.
    pub fn refresh_reset(&mut self, now: DateTime<Utc>) {
        let left = (self.expires_at - now).num_milliseconds();
        self.reset_millis = u64::try_from(left).unwrap_or(0);
    }

    pub fn is_limit_exceeded(&self) -> bool {
        self.remaining.is_some_and(|r| r < 0)
    }

    pub fn is_quota_exceeded(&self) -> bool {
        self.remaining_quota_millis.is_some_and(|r| r < 0)
    }

    /// Whether either dimension is exhausted.
    pub fn is_exceeded(&self) -> bool {
        self.is_limit_exceeded() || self.is_quota_exceeded()
    }
}

/// `budget - used`, floored at [`EXHAUSTED`].
pub fn remaining_after(budget: i64, used: i64) -> i64 {
    budget.saturating_sub(used).max(EXHAUSTED)
}

/// `at + millis`, clamped to the latest representable instant.
pub(crate) fn add_millis(at: DateTime<Utc>, millis: u64) -> DateTime<Utc> {
    Duration::try_milliseconds(saturating_i64(millis))
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub(crate) fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
