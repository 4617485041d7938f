//! Retry policy for provider calls.

use std::{future::Future, time::Duration};

use async_trait::async_trait;

use crate::http::client::RequestError;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed { delay: Duration },
    /// `step * (attempt + 1)`.
    Linear { step: Duration },
    /// `base * factor^attempt`, capped at `max`, optionally with +/- 50% jitter.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Linear { step } => step.saturating_mul(attempt.saturating_add(1)),
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let seconds = base.as_secs_f64() * factor.powi(attempt as i32);
                let mut delay = Duration::from_secs_f64(seconds.min(max.as_secs_f64()));
                if jitter {
                    let half = (delay.as_millis() as u64) / 2;
                    let offset = fastrand::u64(0..=half * 2);
                    delay = Duration::from_millis((delay.as_millis() as u64 + offset).saturating_sub(half));
                }
                delay
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Multiplier applied to the delay after a rate-limit response.
    pub rate_limit_factor: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff, rate_limit_factor: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            rate_limit_factor: rate_limit_factor.max(1),
        }
    }

    /// A single attempt, used for probes.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed { delay: Duration::ZERO },
            rate_limit_factor: 1,
        }
    }

    pub fn delay_for(&self, attempt: u32, err: &RequestError) -> Duration {
        let base = self.backoff.delay(attempt);
        match err {
            RequestError::RateLimited(_) => base.saturating_mul(self.rate_limit_factor),
            _ => base,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent; in the last case the final error is returned.
    pub async fn run<T, F, Fut>(&self, sleeper: &dyn Sleeper, label: &str, mut op: F) -> Result<T, RequestError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RequestError>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt, &err);
                    log::warn!(
                        "{label}: attempt {}/{} failed ({err}), retrying in {:.1}s",
                        attempt + 1,
                        self.max_attempts,
                        delay.as_secs_f64()
                    );
                    sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Sleep seam so retry timing can be observed in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
