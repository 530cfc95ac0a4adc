use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.refilled_at = now;
    }
}

/// Token bucket pacing outgoing requests.
///
/// Holds up to `burst` tokens and refills at `rate` per second. A rate of
/// zero or less disables limiting.
pub struct TokenBucket {
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                burst,
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change rate and burst; the current fill level is kept
    pub fn reconfigure(&self, rate: f64, burst: u32) {
        let mut bucket = self.lock();
        bucket.refill(Instant::now());
        bucket.rate = rate;
        bucket.burst = f64::from(burst.max(1));
        bucket.tokens = bucket.tokens.min(bucket.burst);
    }

    /// Take a token now, or report how long until one is available
    fn try_take(&self) -> Result<(), Duration> {
        let mut bucket = self.lock();
        if bucket.rate <= 0.0 {
            return Ok(());
        }
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate))
        }
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_take() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_is_immediate() {
        let bucket = TokenBucket::new(1.0, 3);
        let start = std::time::Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_paces_after_burst() {
        let bucket = TokenBucket::new(20.0, 1);
        let start = std::time::Instant::now();
        for _ in 0..4 {
            bucket.acquire().await;
        }
        // Three refills at 50ms each
        assert!(start.elapsed() >= Duration::from_millis(140));
    }

    #[tokio::test]
    async fn test_zero_rate_is_unlimited() {
        let bucket = TokenBucket::new(0.0, 1);
        let start = std::time::Instant::now();
        for _ in 0..100 {
            bucket.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
