use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Bounded exponential backoff with jitter.
///
/// Attempt `n` (1-based) waits between half and all of `base_delay * 2^(n-1)`, capped at
/// `max_delay`. After `max_attempts` failures the last error is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Same policy with jitter disabled, for deterministic delays.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Un-jittered delay after the `attempt`-th failure.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay to wait after the `attempt`-th failure.
    pub fn delay(&self, attempt: u32) -> Duration {
        let full = self.backoff(attempt);
        if !self.jitter {
            return full;
        }
        let full_ms = full.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(full_ms / 2..=full_ms);
        Duration::from_millis(jittered)
    }

    /// Whether another attempt may follow the `attempt`-th failure.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Run `op` until it succeeds or the attempts are used up.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.allows(attempt) => {
                    let delay = self.delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        what, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}
