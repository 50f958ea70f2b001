//! Configuration types shared by every stage binary.
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::backoff::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct BackoffConfig {
    #[envconfig(from = "BACKOFF_INITIAL_INTERVAL_MS", default = "2000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "BACKOFF_MAXIMUM_INTERVAL_MS", default = "120000")]
    pub maximum_interval: EnvMsDuration,

    #[envconfig(from = "BACKOFF_MAXIMUM_JITTER_MS", default = "2000")]
    pub maximum_jitter: EnvMsDuration,

    #[envconfig(from = "BACKOFF_MAXIMUM_RETRY_AFTER_MS", default = "120000")]
    pub maximum_retry_after: EnvMsDuration,
}

impl BackoffConfig {
    /// The configured policy with the attempt ceiling of a particular call site.
    pub fn policy(&self, max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::build(self.initial_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .maximum_jitter(self.maximum_jitter.0)
            .maximum_retry_after(self.maximum_retry_after.0)
            .max_attempts(max_attempts)
            .provide()
    }
}
