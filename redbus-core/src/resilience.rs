//! Retry and circuit-breaker primitives for Redis operations.
//!
//! The retry envelope reports attempt counts and wall time so callers can
//! surface them in publish results; the breaker exposes its state machine
//! for health rollups.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

pub mod timeout {
    //! Deadlines for externally blocking operations.

    use std::time::Duration;

    /// Default timeout for a single Redis command round trip
    pub const REDIS_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default timeout for establishing a connection
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Default timeout for a publish confirmation wait
    pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_millis(5_000);
}

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `attempt` (1-based): `min(base·multiplier^(attempt-1), max)`,
    /// scaled by a uniform factor in [0.5, 1.0] when jitter is enabled.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.max_delay.as_secs_f64());

        let scaled = if self.jitter {
            use rand::RngExt;
            capped * rand::rng().random_range(0.5..=1.0)
        } else {
            capped
        };

        Duration::from_secs_f64(scaled)
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Total attempts made, including the first.
    pub attempts: u32,
    pub total_time: Duration,
}

impl<T> RetryOutcome<T> {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

/// Run `op` up to `max_retries + 1` times with exponential backoff.
///
/// Non-retryable errors (validation, rate limits, open breaker) stop the
/// loop immediately; only transient failures consume retry budget.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match op().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                    total_time: started.elapsed(),
                };
            }
            Err(err) => {
                let exhausted = attempts > policy.max_retries;
                if exhausted || !err.is_retryable() {
                    return RetryOutcome {
                        result: Err(err),
                        attempts,
                        total_time: started.elapsed(),
                    };
                }
                tokio::time::sleep(policy.delay_for(attempts)).await;
            }
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker.
///
/// Closed until `failure_threshold` consecutive failures, then open:
/// calls fail fast until `reset_timeout` elapses, after which a single
/// probe runs half-open. Probe success closes the breaker; probe failure
/// reopens it with a fresh timeout.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Whether a call may proceed. Transitions open → half-open once the
    /// reset timeout has elapsed.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed_enough = inner
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                if elapsed_enough {
                    inner.state = BreakerState::HalfOpen;
                    tracing::debug!("Circuit breaker half-open, admitting probe call");
                    Ok(())
                } else {
                    Err(Error::BreakerOpen)
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            tracing::info!("Circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.last_failure_at = Some(Instant::now());
                    tracing::warn!(
                        consecutive_failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.last_failure_at = Some(Instant::now());
                tracing::warn!("Circuit breaker reopened after failed probe");
            }
            BreakerState::Open => {
                inner.last_failure_at = Some(Instant::now());
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Run `op` through the breaker, recording the outcome.
    pub async fn call<T, Fut>(&self, op: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.check()?;
        match op.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_schedule_is_capped_and_non_decreasing() {
        let policy = no_jitter_policy(5);
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for(n)).collect();

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[4], Duration::from_millis(800)); // capped
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: true,
            ..no_jitter_policy(3)
        };
        for _ in 0..100 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry(&no_jitter_policy(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Publish("connection reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let outcome: RetryOutcome<()> = with_retry(&no_jitter_policy(2), || async {
            Err(Error::Publish("still down".into()))
        })
        .await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.attempts, 3); // initial + 2 retries
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_non_retryable() {
        let outcome: RetryOutcome<()> = with_retry(&no_jitter_policy(5), || async {
            Err(Error::Validation("missing field".into()))
        })
        .await;

        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(Error::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(10));

        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.check(), Err(Error::BreakerOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_recovers_through_half_open() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(10));
        breaker.on_failure();
        breaker.on_failure();
        assert!(breaker.check().is_err());

        tokio::time::advance(Duration::from_secs(10)).await;

        // Next call is admitted as the half-open probe
        assert!(breaker.check().is_ok());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_reopens_on_failed_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(5));
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.check().is_ok());

        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(5));
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();

        breaker.on_failure();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
