//! Retry mechanism with exponential backoff
//!
//! Delay for attempt `k` (0-indexed) is `min(initial * multiplier^k, max)`.
//! With jitter the delay is scaled by a uniform factor in `[0.5, 1.0]`.
//! Only errors for which [`DispatchError::is_retryable`] holds are retried.

use crate::config::RetryConfig;
use crate::error::{DispatchError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_retries(&self) -> usize {
        self.config.max_retries
    }

    /// Un-jittered backoff for attempt `k`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let ms = (initial * self.config.multiplier.powi(attempt as i32)).min(max);
        Duration::from_secs_f64(ms.max(0.0) / 1_000.0)
    }

    /// Backoff for attempt `k`, jittered if configured.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.0);
            base.mul_f64(factor)
        } else {
            base
        }
    }
}

/// Progress of one retry loop.
#[derive(Debug)]
pub struct RetryState {
    /// Retries performed so far (0 during the first attempt)
    pub attempt: u32,
    pub last_error: Option<DispatchError>,
}

/// What to do after a failed attempt.
#[derive(Debug, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            last_error: None,
        }
    }

    /// Records `error` and decides whether another attempt should run.
    pub fn on_failure(&mut self, policy: &RetryPolicy, error: DispatchError) -> RetryDecision {
        let decision = if !error.is_retryable() {
            debug!(error = %error, "Non-retryable error");
            RetryDecision::GiveUp
        } else if self.attempt as usize >= policy.max_retries() {
            if policy.max_retries() > 0 {
                warn!(
                    max_retries = policy.max_retries(),
                    error = %error,
                    "Max retries exceeded"
                );
            }
            RetryDecision::GiveUp
        } else {
            let delay = policy.delay_for_attempt(self.attempt);
            self.attempt += 1;
            warn!(
                attempt = self.attempt,
                error = %error,
                delay = ?delay,
                "Attempt failed, retrying"
            );
            RetryDecision::Retry(delay)
        };
        self.last_error = Some(error);
        decision
    }

    fn into_error(self) -> DispatchError {
        self.last_error
            .unwrap_or_else(|| DispatchError::Other("retry loop ended without an error".into()))
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry an async operation with exponential backoff.
///
/// Attempts are strictly sequential. The last error is returned unchanged.
pub async fn retry_async<F, Fut, T>(mut operation: F, policy: &RetryPolicy) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = RetryState::new();
    loop {
        match operation().await {
            Ok(result) => {
                if state.attempt > 0 {
                    debug!(attempts = state.attempt + 1, "Operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(error) => match state.on_failure(policy, error) {
                RetryDecision::Retry(delay) => sleep(delay).await,
                RetryDecision::GiveUp => return Err(state.into_error()),
            },
        }
    }
}

/// Builder for retry operations
pub struct RetryBuilder {
    config: RetryConfig,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }

    pub fn max_retries(mut self, max: usize) -> Self {
        self.config.max_retries = max;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }

    pub async fn run_async<F, Fut, T>(self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_async(operation, &self.build()).await
    }
}
