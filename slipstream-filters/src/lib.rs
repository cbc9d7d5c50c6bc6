//! Slipstream request filters.
//!
//! Filters run before admission: a rejected request never reaches the
//! scheduler or the queue.

pub mod rate_limit;

pub use rate_limit::RateLimiter;
