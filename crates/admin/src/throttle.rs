//! Token-bucket pacing for inter-node transfers.

use tokio::time::{Duration, Instant};

/// Paces a byte stream to a target rate. `rate = 0` disables throttling.
#[derive(Debug)]
pub struct TokenBucket {
    rate_bytes_per_sec: u64,
    available: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        Self {
            rate_bytes_per_sec,
            // One second of burst.
            available: rate_bytes_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    /// Consume `bytes`, sleeping until the bucket can cover them.
    pub async fn throttle(&mut self, bytes: u64) {
        if self.rate_bytes_per_sec == 0 {
            return;
        }

        let rate = self.rate_bytes_per_sec as f64;
        loop {
            let now = Instant::now();
            self.available = (self.available
                + now.duration_since(self.last_refill).as_secs_f64() * rate)
                .min(rate);
            self.last_refill = now;

            if self.available >= bytes as f64 {
                self.available -= bytes as f64;
                return;
            }
            let deficit = bytes as f64 - self.available;
            tokio::time::sleep(Duration::from_secs_f64(deficit / rate)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unthrottled_is_immediate() {
        let mut bucket = TokenBucket::new(0);
        let start = Instant::now();
        for _ in 0..1000 {
            bucket.throttle(1_000_000).await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_burst_within_budget_is_immediate() {
        let mut bucket = TokenBucket::new(10_000);
        let start = Instant::now();
        bucket.throttle(5_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_rate_is_paced() {
        let mut bucket = TokenBucket::new(1_000);
        // Burst budget is 1s (1000 bytes); 3000 bytes total needs ~2s more.
        let start = Instant::now();
        for _ in 0..3 {
            bucket.throttle(1_000).await;
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(1900),
            "expected pacing, got {elapsed:?}"
        );
    }
}
