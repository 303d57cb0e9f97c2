//! Dynamic upload rate limiter.
//!
//! A token bucket refilled at a rate derived from the bytes still to upload
//! and the instant they should be done by. The rate is clamped to the
//! configured floor and ceiling; a ceiling of zero means no ceiling.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct Bucket {
    /// Bytes per second, 0 = unlimited
    rate: u64,
    /// Available bytes; negative when callers borrowed ahead
    available: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct DynamicRateLimiter {
    min_rate: u64,
    max_rate: u64,
    bucket: Mutex<Bucket>,
}

impl DynamicRateLimiter {
    pub fn new(min_rate: u64, max_rate: u64) -> Self {
        Self {
            min_rate,
            max_rate,
            bucket: Mutex::new(Bucket {
                rate: max_rate,
                available: max_rate as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    /// Current rate in bytes per second (0 = unlimited).
    pub async fn rate(&self) -> u64 {
        self.bucket.lock().await.rate
    }

    /// Pace `remaining_bytes` to finish by `target`. Without a target the
    /// ceiling applies.
    pub async fn set_target(
        &self,
        remaining_bytes: u64,
        target: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> u64 {
        let wanted = match target {
            Some(target) if target > now => {
                let seconds = (target - now).num_seconds().max(1) as u64;
                remaining_bytes.div_ceil(seconds).max(self.min_rate)
            }
            _ => 0,
        };
        let rate = match (wanted, self.max_rate) {
            (0, max) => max,
            (wanted, 0) => wanted,
            (wanted, max) => wanted.min(max),
        };

        let mut bucket = self.bucket.lock().await;
        bucket.rate = rate;
        bucket.available = bucket.available.min(rate as f64);
        debug!("Upload rate set to {} bytes/s for {} bytes", rate, remaining_bytes);
        rate
    }

    /// Wait until `bytes` may be sent.
    pub async fn acquire(&self, bytes: u64) {
        let wait = {
            let mut bucket = self.bucket.lock().await;
            if bucket.rate == 0 {
                return;
            }
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            let rate = bucket.rate as f64;
            bucket.available = (bucket.available + elapsed * rate).min(rate);
            bucket.last_refill = now;
            bucket.available -= bytes as f64;
            if bucket.available >= 0.0 {
                return;
            }
            Duration::from_secs_f64(-bucket.available / rate)
        };
        tokio::time::sleep(wait).await;
    }
}
