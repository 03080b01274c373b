use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::IngestConfig;
use crate::{RecallError, Result};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(n-1)` after the n-th failure, capped at `cap`
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay after the `failed_attempt`-th failure (1-based).
    #[inline]
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, cap } => {
                let exponent = failed_attempt.saturating_sub(1).min(31);
                base.saturating_mul(1_u32 << exponent).min(cap)
            }
        }
    }
}

/// Which failures are worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOn {
    AnyError,
    /// Only [`RecallError::is_transient`] failures
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retry_on: RetryOn,
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    #[inline]
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retry_on: RetryOn::AnyError,
        }
    }

    #[inline]
    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(
            config.max_retries,
            Backoff::Exponential {
                base: Duration::from_millis(config.retry_base_ms),
                cap: Duration::from_millis(config.retry_max_ms),
            },
        )
    }

    #[inline]
    pub fn retry_on(mut self, retry_on: RetryOn) -> Self {
        self.retry_on = retry_on;
        self
    }

    fn should_retry(&self, error: &RecallError) -> bool {
        match self.retry_on {
            RetryOn::AnyError => true,
            RetryOn::Transient => error.is_transient(),
        }
    }

    /// Run `op` until it succeeds, hits a non-retryable error, or exhausts `max_attempts`.
    /// `op` receives the 1-based attempt number.
    #[inline]
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", label, attempt);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) => {
                    if attempt >= self.max_attempts || !self.should_retry(&error) {
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt,
                        };
                    }

                    let delay = self.backoff.delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label, attempt, self.max_attempts, error, delay
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
