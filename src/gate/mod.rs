//! Gateway facade: admits requests before they run and charges quota after.

mod context;
mod service;

pub use context::RequestContext;
pub use service::{PolicyStatus, RateLimitExceeded, RateLimitGate};
