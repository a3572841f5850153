use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::warn;

/// Unified retry policy shared by the HTTP client and the bot save path.
///
/// Exponential backoff with a small time-derived jitter; the caller decides
/// which errors are worth retrying through the `retryable` predicate.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .base_delay
            .as_millis()
            .min(u128::from(u64::MAX)) as u64;
        let backoff = base.saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        Duration::from_millis(backoff.saturating_add(jitter))
    }

    /// Run `op`, retrying on errors classified retryable by `retryable`,
    /// sleeping between attempts. The final error is returned unchanged.
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T>,
        retryable: impl Fn(&anyhow::Error) -> bool,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(error) if attempt + 1 < self.max_attempts && retryable(&error) => {
                    warn!(attempt, error = %error, "retrying after error");
                    sleep(self.delay_for(attempt));
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
