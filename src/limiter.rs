// src/limiter.rs

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Process-wide bandwidth cap shared by every transfer.
#[derive(Clone, Debug)]
pub struct SpeedLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

#[derive(Debug)]
struct TokenBucket {
    /// Bytes per second; 0 disables the cap.
    rate: u64,
    /// One second worth of bytes, which bounds bursts.
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
}

impl SpeedLimiter {
    pub fn new(rate: u64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket {
                rate,
                capacity: rate,
                tokens: rate,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub async fn set_rate(&self, rate: u64) {
        let mut bucket = self.bucket.lock().await;
        bucket.rate = rate;
        bucket.capacity = rate;
        bucket.tokens = rate;
        bucket.last_refill = Instant::now();
    }

    /// Waits until `amount` bytes may be written. Requests larger than the
    /// bucket are paid in capacity-sized installments.
    pub async fn acquire(&self, mut amount: u64) {
        while amount > 0 {
            let mut bucket = self.bucket.lock().await;
            if bucket.rate == 0 {
                return;
            }
            bucket.refill();

            let want = amount.min(bucket.capacity);
            if bucket.tokens >= want {
                bucket.tokens -= want;
                amount -= want;
                continue;
            }

            let missing = want - bucket.tokens;
            let wait = Duration::from_secs_f64(missing as f64 / bucket.rate as f64);
            drop(bucket);
            tokio::time::sleep(wait).await;
        }
    }
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let earned = (now.duration_since(self.last_refill).as_secs_f64() * self.rate as f64) as u64;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(self.capacity);
            self.last_refill = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = SpeedLimiter::unlimited();
        let started = Instant::now();
        limiter.acquire(u64::MAX / 2).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn capped_rate_paces_writes() {
        let limiter = SpeedLimiter::new(2000);
        let started = Instant::now();
        // The initial bucket covers 2000 bytes, the remaining 1000 cost ~500ms.
        limiter.acquire(3000).await;
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn rate_can_change_at_runtime() {
        let limiter = SpeedLimiter::new(10);
        limiter.set_rate(0).await;
        tokio::time::timeout(Duration::from_millis(100), limiter.acquire(1_000_000))
            .await
            .unwrap();
    }
}
