//! Token bucket limiting outbound hosting API calls.
//!
//! The bucket holds at most `burst` tokens and gains one every `interval`.
//! [`RateLimiter::acquire`] takes a token, sleeping until one is available.
//! The limiter is shared by every worker in the process.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default refill interval (four calls per second).
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

/// Default bucket capacity.
pub const DEFAULT_BURST: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("cancelled while waiting for a rate limit token")]
    Cancelled,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    /// Time up to which refills have been credited.
    refilled_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: u32,
    bucket: Mutex<Bucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_BURST)
    }
}

impl RateLimiter {
    /// Creates a full bucket. A zero `interval` disables limiting; a zero
    /// `burst` is treated as one.
    pub fn new(interval: Duration, burst: u32) -> Self {
        let burst = burst.max(1);
        Self {
            interval,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Waits for and consumes one token, or fails once `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        if self.interval.is_zero() {
            return Ok(());
        }
        loop {
            if cancel.is_cancelled() {
                return Err(RateLimitError::Cancelled);
            }
            let wait = match self.try_take().await {
                None => return Ok(()),
                Some(wait) => wait,
            };
            tokio::select! {
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Takes a token if one is available, otherwise returns how long until
    /// the next refill.
    async fn try_take(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.refilled_at);
        let earned = (elapsed.as_nanos() / self.interval.as_nanos()).min(u128::from(self.burst)) as u32;
        if earned > 0 {
            bucket.tokens = (bucket.tokens + earned).min(self.burst);
            bucket.refilled_at = if bucket.tokens == self.burst {
                now
            } else {
                bucket.refilled_at + self.interval * earned
            };
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            if bucket.tokens + 1 == self.burst {
                // Leaving a full bucket: refill is measured from now.
                bucket.refilled_at = now;
            }
            None
        } else {
            Some(self.interval.saturating_sub(now.saturating_duration_since(bucket.refilled_at)))
        }
    }
}
