//! Token-bucket rate limiting primitives.
//!
//! - [`TokenBucket`]: one lazily-refilled credit balance per client key
//! - [`RateLimitStore`]: the pluggable `key -> bucket` backend consumed by
//!   [`RateLimitLayer`](crate::middleware::RateLimitLayer)
//! - [`InMemoryRateLimitStore`]: the in-process backend

pub mod bucket;
pub mod store;

use std::time::Duration;

pub use bucket::TokenBucket;
pub use store::{InMemoryRateLimitStore, RateLimitStore, StoreError};

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Time until one whole token is available again (rejections only).
    pub retry_after: Option<Duration>,
}

impl Admission {
    pub const fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    pub const fn rejected(retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }

    /// Retry hint in whole seconds, rounded up. `None` when no positive hint exists.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after
            .filter(|d| !d.is_zero())
            .map(|d| d.as_secs_f64().ceil().max(1.0) as u64)
    }
}
