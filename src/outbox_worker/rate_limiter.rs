use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::{sleep, Instant};

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket allowing `max` acquisitions per `window`, with bursts up to
/// `max`.
pub struct TokenBucket {
    capacity: f64,
    per_second: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(max: u32, window: Duration) -> Self {
        let capacity = f64::from(max.max(1));
        let window = window.max(Duration::from_millis(1));
        Self {
            capacity,
            per_second: capacity / window.as_secs_f64(),
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take a token, or report how long until one is available.
    fn take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.per_second).min(self.capacity);
        state.refilled_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - state.tokens) / self.per_second))
        }
    }

    pub fn try_acquire(&self) -> bool {
        self.take().is_ok()
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        while let Err(wait) = self.take() {
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn allows_a_burst_then_paces() {
        let bucket = TokenBucket::new(2, Duration::from_secs(1));
        let started = Instant::now();

        bucket.acquire().await;
        bucket.acquire().await;
        assert!(!bucket.try_acquire());

        bucket.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(499));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_up_to_capacity() {
        let bucket = TokenBucket::new(3, Duration::from_secs(1));
        for _ in 0..3 {
            assert!(bucket.try_acquire());
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        for _ in 0..3 {
            assert!(bucket.try_acquire());
        }
        assert!(!bucket.try_acquire());
    }
}
