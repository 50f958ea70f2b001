//! # Backoff
//!
//! Policy deciding how long to wait between attempts of an upstream call, and the retry loop
//! every network call goes through.
use std::future::Future;
use std::time;

use rand::Rng;
use thiserror::Error;
use tracing::warn;

use crate::upstream::UpstreamError;

/// How an attempt's failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySignal {
    /// The upstream asked us to slow down, optionally saying for how long.
    RateLimited(Option<time::Duration>),
    Transient,
    /// Retrying would not change the outcome.
    Terminal,
}

/// The retry loop gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("{0}")]
    Terminal(UpstreamError),
    #[error("max retries reached after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: UpstreamError,
    },
}

impl RetryError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RetryError::Terminal(error) => error.status_code(),
            RetryError::Exhausted { last_error, .. } => last_error.status_code(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Exponential backoff with jitter, honouring server supplied retry hints.
pub struct BackoffPolicy {
    /// The base delay before the first retry, doubled for every further attempt.
    pub initial_interval: time::Duration,
    /// Ceiling for any computed delay.
    pub maximum_interval: time::Duration,
    /// Ceiling for a server supplied `Retry-After`.
    pub maximum_retry_after: time::Duration,
    /// Upper bound of the random jitter added to transient failure delays.
    pub maximum_jitter: time::Duration,
    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Initialize a `BackoffPolicyBuilder`.
    pub fn build(initial_interval: time::Duration) -> BackoffPolicyBuilder {
        BackoffPolicyBuilder::new(initial_interval)
    }

    /// The same policy with a different attempt ceiling.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self.clone()
        }
    }

    /// `initial_interval * 2^attempt`, capped at `maximum_interval`. `attempt` is zero based.
    pub fn base_interval(&self, attempt: u32) -> time::Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_interval
            .checked_mul(factor)
            .unwrap_or(self.maximum_interval)
            .min(self.maximum_interval)
    }

    /// Delay to wait after the failed `attempt` (zero based) before trying again.
    /// Returns `None` for terminal failures, which are never retried.
    pub fn retry_interval(
        &self,
        attempt: u32,
        signal: &RetrySignal,
        jitter: time::Duration,
    ) -> Option<time::Duration> {
        match signal {
            RetrySignal::RateLimited(Some(hint)) => Some((*hint).min(self.maximum_retry_after)),
            RetrySignal::RateLimited(None) => Some(self.base_interval(attempt)),
            RetrySignal::Transient => Some(
                (self.base_interval(attempt) + jitter.min(self.maximum_jitter))
                    .min(self.maximum_interval),
            ),
            RetrySignal::Terminal => None,
        }
    }

    pub fn sample_jitter(&self) -> time::Duration {
        let max_millis = self.maximum_jitter.as_millis() as u64;
        if max_millis == 0 {
            return time::Duration::ZERO;
        }
        time::Duration::from_millis(rand::thread_rng().gen_range(0..=max_millis))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `BackoffPolicy`.
pub struct BackoffPolicyBuilder {
    pub initial_interval: time::Duration,
    pub maximum_interval: time::Duration,
    pub maximum_retry_after: time::Duration,
    pub maximum_jitter: time::Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicyBuilder {
    fn default() -> Self {
        Self {
            initial_interval: time::Duration::from_secs(2),
            maximum_interval: time::Duration::from_secs(120),
            maximum_retry_after: time::Duration::from_secs(120),
            maximum_jitter: time::Duration::from_secs(2),
            max_attempts: 3,
        }
    }
}

impl BackoffPolicyBuilder {
    pub fn new(initial_interval: time::Duration) -> Self {
        Self {
            initial_interval,
            ..BackoffPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> BackoffPolicyBuilder {
        self.maximum_interval = interval;
        self
    }

    pub fn maximum_retry_after(mut self, interval: time::Duration) -> BackoffPolicyBuilder {
        self.maximum_retry_after = interval;
        self
    }

    pub fn maximum_jitter(mut self, jitter: time::Duration) -> BackoffPolicyBuilder {
        self.maximum_jitter = jitter;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> BackoffPolicyBuilder {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Provide a `BackoffPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            maximum_retry_after: self.maximum_retry_after,
            maximum_jitter: self.maximum_jitter,
            max_attempts: self.max_attempts,
        }
    }
}

/// Run `operation` until it succeeds, fails terminally or runs out of attempts.
///
/// Sleeps happen on the calling task only. No sleep follows the final attempt.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    target: &'static str,
    mut operation: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt: u32 = 0;

    loop {
        metrics::counter!("harvest_upstream_attempts_total", "target" => target).increment(1);

        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let signal = error.retry_signal();
        let Some(delay) = policy.retry_interval(attempt, &signal, policy.sample_jitter()) else {
            return Err(RetryError::Terminal(error));
        };

        attempt += 1;
        if attempt >= policy.max_attempts {
            metrics::counter!("harvest_upstream_exhausted_total", "target" => target).increment(1);
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        }

        warn!(
            target_call = target,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "upstream call failed, retrying"
        );
        metrics::counter!("harvest_upstream_retries_total", "target" => target).increment(1);
        tokio::time::sleep(delay).await;
    }
}
