//! Ratewarden - Rate Limiting for HTTP Gateways
//!
//! This crate decides whether a request passing through a gateway may
//! proceed. Configured policies select the requests they apply to, each
//! request is counted under a key derived from its identity, and capacity is
//! spent in two phases: one request before the handler runs and the measured
//! duration afterwards. State lives in memory, in Redis, or in token buckets.

pub mod config;
pub mod error;
pub mod gate;
pub mod policy;
pub mod ratelimit;
pub mod request;
