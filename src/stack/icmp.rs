//! Rate-limited ICMP echo handling.

use std::sync::Mutex;
use std::time::Instant;

/// Token bucket bounding how many ICMP replies the stack emits.
pub struct IcmpRateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl IcmpRateLimiter {
    pub fn new(rate: u32, burst: u32) -> Self {
        Self {
            rate: rate as f64,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                refilled: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.refilled = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// ICMP type byte for an echo request.
pub const ECHO_REQUEST: u8 = 8;
