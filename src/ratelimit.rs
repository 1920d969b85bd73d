//! Token-bucket rate limiting.
//!
//! One bucket per client session plus a process-wide bucket in the router.
//! Tokens refill continuously at `rate` per second up to `burst`; each
//! admitted packet costs one token.

use std::sync::Mutex;
use std::time::Instant;

/// Classic token bucket. Thread-safe; `allow` is the only operation.
pub struct TokenBucket {
    max_tokens: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket that admits bursts of `burst` and sustains `rate` per second.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            max_tokens: f64::from(burst),
            refill_rate: rate,
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refill by elapsed time, then try to take one token.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("token bucket lock poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("max_tokens", &self.max_tokens)
            .field("refill_rate", &self.refill_rate)
            .finish_non_exhaustive()
    }
}
