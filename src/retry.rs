//! Retry policy: exponential backoff with a cap, cancellation-aware
//!
//! The consumer core owns retry; handlers never loop themselves. Delays are
//! deterministic (`min(initial * 2^n, max)`) so operators can reason about
//! worst-case redelivery latency, and every sleep races the shutdown token.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; the handler runs at most
    /// `max_retries + 1` times.
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Backoff before retrying attempt `attempt` (0-indexed): doubles each
    /// time, saturating at `max_delay`.
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        let multiplier = 2u32.saturating_pow(exponent);
        let delay = self
            .initial_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

/// Why the retry loop gave up.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The shutdown token fired before or between attempts.
    #[error("retry cancelled by shutdown")]
    Cancelled,
    /// First non-retryable error, returned without further attempts.
    #[error("non-retryable failure: {0}")]
    Fatal(WorkerError),
    /// Retry budget spent; wraps the last observed error.
    #[error("max retries exceeded after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: WorkerError },
}

/// Abstraction over backoff sleeps so tests run without real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// No-op sleeper for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {}
}

/// Records requested durations without sleeping.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}

/// Run `op` under the retry policy.
///
/// The closure receives the 0-indexed attempt number (callers hang metrics off
/// attempts > 0). Non-retryable errors and cancellation return immediately;
/// exhaustion wraps the last error.
pub async fn run<T, Op, Fut>(
    config: &RetryConfig,
    shutdown: &CancellationToken,
    sleeper: &dyn Sleeper,
    mut op: Op,
) -> Result<T, RetryError>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    let total_attempts = config.max_retries + 1;
    for attempt in 0..total_attempts {
        if shutdown.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(RetryError::Fatal(e)),
            Err(e) => {
                if attempt + 1 == total_attempts {
                    return Err(RetryError::Exhausted { attempts: total_attempts, last: e });
                }
                let delay = config.delay(attempt);
                tracing::debug!(attempt, ?delay, error = %e, "attempt failed, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(RetryError::Cancelled),
                    _ = sleeper.sleep(delay) => {}
                }
            }
        }
    }
    unreachable!("retry loop returns from within")
}
