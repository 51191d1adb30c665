//! A single lazily-refilled token bucket.
//!
//! # Algorithm
//!
//! ```text
//! elapsed     = now - last_refill
//! tokens      = min(capacity, tokens + elapsed * refill_rate)
//! last_refill = now
//! tokens >= 1 ? (tokens -= 1, admit) : reject
//! ```
//!
//! There is no timer per bucket: credit is recomputed on every check in O(1),
//! however long the bucket sat idle. The whole refill-and-withdraw step runs
//! under one mutex, so concurrent callers never observe a half-updated bucket.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::Admission;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket for one rate-limit key.
///
/// Invariant: `0 <= tokens <= capacity` whenever the lock is released.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens per second
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Full bucket of `limit` tokens refilling `limit` per `window`.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self::new_at(limit, window, Instant::now())
    }

    /// Same as [`TokenBucket::new`] with an explicit creation time.
    pub fn new_at(limit: u32, window: Duration, now: Instant) -> Self {
        let capacity = f64::from(limit);
        let window_secs = window.as_secs_f64();
        let refill_rate = if window_secs > 0.0 {
            capacity / window_secs
        } else {
            capacity
        };

        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Try to withdraw one token now.
    pub fn try_consume(&self) -> bool {
        self.try_consume_at(Instant::now()).allowed
    }

    /// Refill up to `now`, then try to withdraw one token.
    ///
    /// A rejection leaves the refilled, possibly fractional, balance in place
    /// and reports how long until a whole token is available.
    pub fn try_consume_at(&self, now: Instant) -> Admission {
        // Pure arithmetic under the lock: a poisoned lock still holds a
        // consistent state, so keep using it.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = state.last_refill.max(now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Admission::allowed();
        }

        // No hint when nothing refills or the wait does not fit in a Duration
        let retry_after = (self.refill_rate > 0.0)
            .then(|| (1.0 - state.tokens) / self.refill_rate)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
        Admission::rejected(retry_after)
    }

    /// Current balance, without refilling.
    pub fn tokens(&self) -> f64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tokens
    }

    /// Time of the last refill (the last admission check).
    pub fn last_refill(&self) -> Instant {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_refill
    }
}
