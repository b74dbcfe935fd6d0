//! LLM client decorators.

pub mod rate_limited;

pub use rate_limited::{from_settings, limit_shared, RateLimitedLlm};
