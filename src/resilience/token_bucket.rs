use std::time::Duration;
use tokio::time::Instant;

/// Classic token bucket with lazy refill.
///
/// - Starts full
/// - Refills on access from elapsed time (no background timer)
/// - Not synchronized; owners guard it with their own lock
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `refill_rate` is in tokens per second.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        let capacity = if capacity.is_finite() { capacity.max(0.0) } else { 0.0 };
        let refill_rate = if refill_rate.is_finite() {
            refill_rate.max(0.0)
        } else {
            0.0
        };
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Bucket sized for a per-minute budget: holds one minute's worth, refills at `per_minute / 60`.
    pub fn per_minute(per_minute: u64) -> Self {
        let capacity = per_minute as f64;
        Self::new(capacity, capacity / 60.0)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Current token count after refill.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Consume `n` tokens if present; otherwise leave the bucket unchanged.
    ///
    /// Negative or non-finite draws are refused.
    pub fn try_consume(&mut self, n: f64) -> bool {
        if !is_valid_draw(n) {
            return false;
        }
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Consume `n` tokens unconditionally, flooring at zero.
    ///
    /// Used after a caller already waited out [`TokenBucket::wait_time`].
    pub fn force_consume(&mut self, n: f64) {
        if !is_valid_draw(n) {
            return;
        }
        self.refill();
        self.tokens = (self.tokens - n).max(0.0);
    }

    /// Time until `n` tokens are available. Zero if they already are.
    ///
    /// Requests above capacity are measured against a full bucket.
    pub fn wait_time(&mut self, n: f64) -> Duration {
        self.refill();
        let needed = n.min(self.capacity);
        if self.tokens >= needed {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64((needed - self.tokens) / self.refill_rate)
            .unwrap_or(Duration::MAX)
    }
}

fn is_valid_draw(n: f64) -> bool {
    n.is_finite() && n >= 0.0
}
