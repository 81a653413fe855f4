//! Backoff for completion-service calls
//!
//! Only the completion call is ever repeated. Tool invocations are not: a
//! remote tool may have side effects, so whether to try one again is the
//! model's decision, made after it sees the error-flagged result.
//!
//! ```rust,no_run
//! use toolwire::retry::{retry_with_backoff_conditional, RetryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> toolwire::Result<()> {
//! let policy = RetryConfig::default()
//!     .with_max_attempts(3)
//!     .with_initial_delay(Duration::from_millis(250));
//!
//! let answer = retry_with_backoff_conditional(policy, || async {
//!     Ok::<_, toolwire::Error>(42)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// How many times to attempt a call and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Never below 1.
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any single wait, before jitter.
    pub max_delay: Duration,
    /// Growth of the wait per failed attempt.
    pub backoff_multiplier: f64,
    /// Width of the random spread around each wait, as a fraction of it.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// One attempt, no waiting.
    pub fn disabled() -> Self {
        Self::default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Wait before the attempt following failure number `failures` (0-based),
    /// without jitter.
    fn nominal_delay(&self, failures: u32) -> f64 {
        let grown = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(failures as i32);
        grown.min(self.max_delay.as_secs_f64())
    }

    fn delay_after(&self, failures: u32) -> Duration {
        let nominal = self.nominal_delay(failures);
        let spread = nominal * self.jitter_factor;
        // uniform in [nominal - spread/2, nominal + spread/2)
        let offset = (rand::random::<f64>() - 0.5) * spread;
        Duration::from_secs_f64((nominal + offset).max(0.0))
    }
}

/// Whether a failed completion call is worth repeating.
///
/// Transient conditions qualify: network errors, timeouts, broken streams and
/// 5xx statuses. Protocol and tool errors never do, since the same request
/// would meet the same answer.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::Http(_) | Error::Timeout | Error::Stream(_) => true,
        Error::Transport { status, .. } => (500..600).contains(status),
        Error::Api(msg) => ["500", "502", "503", "504"].iter().any(|code| msg.contains(code)),
        _ => false,
    }
}

/// Repeat `operation` on any error until it succeeds or attempts run out.
pub async fn retry_with_backoff<F, Fut, T>(config: RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run(config, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but gives up on the first error that
/// [`is_retryable_error`] rejects.
pub async fn retry_with_backoff_conditional<F, Fut, T>(
    config: RetryConfig,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run(config, operation, is_retryable_error).await
}

async fn run<F, Fut, T>(
    config: RetryConfig,
    mut operation: F,
    retryable: impl Fn(&Error) -> bool,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut failures = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        failures += 1;
        if failures >= config.max_attempts || !retryable(&err) {
            return Err(err);
        }

        let wait = config.delay_after(failures - 1);
        log::debug!(
            "completion attempt {}/{} failed: {}; next in {:?}",
            failures,
            config.max_attempts,
            err,
            wait
        );
        tokio::time::sleep(wait).await;
    }
}
