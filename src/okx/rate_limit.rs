// =============================================================================
// Token-bucket rate limiter — process-wide backpressure for exchange calls
// =============================================================================
//
// Every REST request acquires a token first. The bucket refills continuously
// at `capacity` tokens per second, so a burst can drain it and subsequent
// callers queue on the internal lock until tokens accrue. This is the primary
// backpressure point; the per-symbol scheduler semaphore is the secondary one.
// =============================================================================

use std::time::Instant;

use tokio::sync::Mutex;
use tracing::trace;

struct Bucket {
    tokens: f64,
    last_fill: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `requests_per_second` is both burst capacity and refill rate.
    pub fn new(requests_per_second: u32) -> Self {
        let capacity = f64::from(requests_per_second.max(1));
        Self {
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_fill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_fill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.capacity).min(self.capacity);
                bucket.last_fill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    trace!(remaining = bucket.tokens, "rate-limit token acquired");
                    return;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_within_capacity_does_not_block() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed().as_millis() < 100, "burst should be instant");
    }

    #[tokio::test]
    async fn exhausted_bucket_forces_wait() {
        let limiter = RateLimiter::new(5);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await; // 6th must wait for refill
        assert!(
            start.elapsed().as_millis() >= 90,
            "6th acquire should wait for a refill tick"
        );
    }

    #[tokio::test]
    async fn zero_capacity_clamped_to_one() {
        let limiter = RateLimiter::new(0);
        limiter.acquire().await; // must not deadlock
    }
}
