//! Circuit breaker protecting the outbound provider
//!
//! Closed/Open/HalfOpen state machine, one instance per provider. Transitions
//! are serialized by a single mutex; the lock is never held across the
//! protected call.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Clock abstraction so breaker timing can be faked in tests.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before admitting trial calls.
    pub reset_timeout: Duration,
    /// Concurrent trial calls admitted while `HalfOpen`.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

/// Rejection or pass-through failure from [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; the protected operation was not invoked.
    Open { failures: u32 },
    /// The operation ran and failed.
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { failures } => {
                write!(f, "circuit breaker open ({failures} consecutive failures)")
            }
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Open { .. } => None,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure_at_millis: u64,
    half_open_in_flight: u32,
}

/// Process-wide breaker; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Mutex<BreakerInner>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure_at_millis: 0,
                half_open_in_flight: 0,
            })),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock for deterministic tests.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Current state, for diagnostics. Consistent with the most recent
    /// transition; does not itself trigger the open → half-open move.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Invoke `op` under the breaker. Rejected calls return
    /// [`BreakerError::Open`] without running the operation; outcomes of
    /// admitted calls drive the state machine.
    pub async fn call<T, E, Fut, Op>(&self, mut op: Op) -> Result<T, BreakerError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        let result = op().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result.map_err(BreakerError::Inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide admission under the lock. Returns whether this call is a
    /// half-open trial.
    fn admit<E>(&self) -> Result<bool, BreakerError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = self.clock.now_millis().saturating_sub(inner.last_failure_at_millis);
                if elapsed >= self.config.reset_timeout.as_millis() as u64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_in_flight = 1;
                    tracing::info!("circuit breaker half-open, admitting trial call");
                    Ok(true)
                } else {
                    Err(BreakerError::Open { failures: inner.failures })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(true)
                } else {
                    Err(BreakerError::Open { failures: inner.failures })
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.half_open_in_flight = 0;
                tracing::info!("circuit breaker closed after successful trial");
            }
            // A trial completing after another trial already closed the
            // circuit lands in the Closed arm; it just resets the counter.
            CircuitState::Closed => inner.failures = 0,
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_failure_at_millis = self.clock.now_millis();
                inner.half_open_in_flight = 0;
                tracing::warn!(failures = inner.failures, "trial call failed, circuit re-opened");
            }
            CircuitState::Closed => {
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure_at_millis = self.clock.now_millis();
                    tracing::error!(
                        failures = inner.failures,
                        threshold = self.config.failure_threshold,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}
