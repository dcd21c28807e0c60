//! Bounded retries with exponential backoff
//!
//! Used for registry lookups, which fail transiently often enough on shared CI
//! runners that a single attempt is not good enough.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Randomize each delay between half and the full backoff value
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry` (0-based), before jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay(&self, retry: u32, rng: &mut fastrand::Rng) -> Duration {
        let backoff = self.backoff(retry);
        if !self.jitter {
            return backoff;
        }
        let millis = backoff.as_millis() as u64;
        let half = millis / 2;
        Duration::from_millis(half + rng.u64(0..=millis - half))
    }
}

/// Run `operation` until it succeeds, a non-transient error occurs, or the
/// retry budget is exhausted. The last error is returned on failure.
pub async fn retry_async<T, E, Fut, Op, C>(
    policy: &RetryPolicy,
    mut operation: Op,
    is_transient: C,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut rng = fastrand::Rng::new();
    let mut retry = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if retry < policy.max_retries && is_transient(&error) => {
                let delay = policy.delay(retry, &mut rng);
                debug!(
                    "Attempt {} failed ({}), retrying in {:?}",
                    retry + 1,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
            Err(error) => {
                if retry > 0 {
                    warn!("Giving up after {} attempts: {}", retry + 1, error);
                }
                return Err(error);
            }
        }
    }
}
