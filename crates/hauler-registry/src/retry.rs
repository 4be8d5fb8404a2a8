//! Retrying remote fetches.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;

/// How often and how patiently a remote operation is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt; doubled for each one after.
    pub base_delay: Duration,
    /// Deadline of a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_secs(5),
            attempt_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// A policy for tests: same attempts, millisecond backoff.
    pub fn fast() -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            attempt_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// Errors that carry a not-found [`hauler::Error`] are returned at once.
    /// Once every attempt has failed the last error is wrapped in
    /// [`hauler::Error::SourceUnavailable`] naming `origin`.
    pub async fn run<T, F, Fut>(&self, origin: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match tokio::time::timeout(self.attempt_timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    if e.downcast_ref::<hauler::Error>()
                        .is_some_and(hauler::Error::is_not_found)
                    {
                        return Err(e);
                    }
                    e
                }
                Err(_) => anyhow::anyhow!("timed out after {:?}", self.attempt_timeout),
            };
            if attempt >= attempts {
                return Err(hauler::Error::SourceUnavailable {
                    origin: origin.to_string(),
                    cause: err.into(),
                }
                .into());
            }
            let delay = self.delay(attempt);
            tracing::warn!("{origin}: attempt {attempt}/{attempts} failed: {err:#}; retrying in {delay:?}");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
