// Token bucket
// Fixed-capacity bucket with lazy refill; the primitive under the
// cluster rate limiter
//
// Numan Thabit 2025 Nov

use std::sync::Mutex;
use std::time::Instant;

struct BucketState {
    capacity: i64,
    tokens: i64,
    /// Refill rate, tokens/second.
    rate: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket. The mutex is held only for the O(1)
/// refill-and-decrement arithmetic.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(capacity: i64, rate: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                capacity,
                tokens: capacity,
                rate,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_n_at(1, Instant::now())
    }

    pub fn allow_n(&self, n: i64) -> bool {
        self.allow_n_at(n, Instant::now())
    }

    /// Refills with the old rate up to `now` before switching, so tokens
    /// accrued under the previous rate are not re-priced.
    pub fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock().unwrap();
        refill(&mut state, Instant::now());
        state.rate = rate;
    }

    pub fn set_capacity(&self, capacity: i64) {
        let mut state = self.state.lock().unwrap();
        state.capacity = capacity;
        state.tokens = state.tokens.min(capacity);
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.tokens = state.capacity;
        state.last_refill = Instant::now();
    }

    pub fn tokens(&self) -> i64 {
        let mut state = self.state.lock().unwrap();
        refill(&mut state, Instant::now());
        state.tokens
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap().rate
    }

    pub fn capacity(&self) -> i64 {
        self.state.lock().unwrap().capacity
    }

    pub fn is_empty(&self) -> bool {
        self.tokens() == 0
    }

    pub fn is_full(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        refill(&mut state, Instant::now());
        state.tokens == state.capacity
    }

    pub(crate) fn allow_n_at(&self, n: i64, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        refill(&mut state, now);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }
}

/// Lazy refill: `tokens := min(capacity, tokens + floor(elapsed * rate))`.
/// `last_refill` only advances when whole tokens were added, so fractional
/// accrual is carried implicitly until it amounts to one token.
fn refill(state: &mut BucketState, now: Instant) {
    let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
    if elapsed <= 0.0 {
        return;
    }

    let to_add = (elapsed * state.rate).floor() as i64;
    if to_add > 0 {
        state.tokens = state.capacity.min(state.tokens + to_add);
        state.last_refill = now;
    }
}
