//! Token-bucket rate limiter used to throttle TLS handshake attempts.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::utils::clock::now;

struct Bucket {
    tokens: f64,
    last_refill: quanta::Instant,
}

/// Refills `rate` tokens per tick and allows bursts up to `capacity`.
///
/// `new(rate, capacity)` mirrors the call sites that convert a per-second
/// budget into a per-tick rate (`per_second / 100`) and a fixed burst of
/// `capacity` ticks; `wait()` blocks the caller until a token is available.
#[derive(Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    rate_per_tick: f64,
    capacity: f64,
}

impl RateLimiter {
    pub fn new(rate_per_tick: u32, capacity: u32) -> Self {
        RateLimiter {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity as f64,
                last_refill: now(),
            })),
            rate_per_tick: rate_per_tick.max(1) as f64,
            capacity: capacity.max(1) as f64,
        }
    }

    /// Waits until a single token is available, sleeping in small increments.
    pub async fn wait(&self) {
        loop {
            {
                let mut bucket = self.bucket.lock();
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                // Ticks happen every 1/100s, matching how callers derive `rate_per_tick`.
                let refilled = elapsed * 100.0 * self.rate_per_tick;
                if refilled > 0.0 {
                    bucket.tokens = (bucket.tokens + refilled).min(self.capacity);
                    bucket.last_refill = now();
                }
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
            }
            sleep(Duration::from_millis(2)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_burst_up_to_capacity() {
        let limiter = RateLimiter::new(1, 4);
        for _ in 0..4 {
            limiter.wait().await;
        }
    }
}
