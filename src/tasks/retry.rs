use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::pacing::{CancelToken, Cancelled, PaceKind, Pacer};
use crate::client::{ErrorClass, PlatformError};
use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    /// Re-enqueue no sooner than this; never retry inline.
    Defer(Duration),
    Fail,
}

/// Which errors are retried, how often, and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub flood_margin: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_secs(config.backoff_secs),
            flood_margin: Duration::from_secs(config.flood_margin_secs),
        }
    }

    /// `attempt` counts the attempts already made, starting at 1.
    pub fn decide(&self, err: &PlatformError, attempt: u32) -> RetryDecision {
        match err.class() {
            ErrorClass::Transient if attempt < self.max_attempts => RetryDecision::RetryAfter(self.backoff),
            ErrorClass::RateLimited => {
                RetryDecision::Defer(self.defer_for(err.flood_wait().unwrap_or(0)))
            }
            _ => RetryDecision::Fail,
        }
    }

    pub fn defer_for(&self, wait_seconds: u64) -> Duration {
        Duration::from_secs(wait_seconds) + self.flood_margin
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    Platform(PlatformError),
    Cancelled,
}

impl From<Cancelled> for StepError {
    fn from(_: Cancelled) -> Self {
        StepError::Cancelled
    }
}

impl From<PlatformError> for StepError {
    fn from(err: PlatformError) -> Self {
        StepError::Platform(err)
    }
}

/// Run `op` under the policy. Only transient errors loop; everything else,
/// rate limits included, is returned to the caller.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    pacer: &dyn Pacer,
    cancel: &CancelToken,
    what: &str,
    mut op: F,
) -> Result<T, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let mut attempt = 1;
    loop {
        match cancel.guard(op()).await? {
            Ok(value) => return Ok(value),
            Err(err) => match policy.decide(&err, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, policy.max_attempts, err);
                    pacer.pause(PaceKind::Backoff, delay, cancel).await?;
                    attempt += 1;
                }
                RetryDecision::Defer(_) | RetryDecision::Fail => return Err(StepError::Platform(err)),
            },
        }
    }
}
