//! Attempt limiting for credentials and attaches.

pub mod rate_limit;

pub use rate_limit::{AttemptWindow, RateLimitSettings, ServerRateLimits};
