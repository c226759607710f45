//! Bounded exponential backoff for transient failures.
//!
//! Uses `backon` for the backoff schedule and the retry loop.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::SagaError;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY_MS: u64 = 100;
const DEFAULT_MAX_DELAY_MS: u64 = 5_000;
const DEFAULT_MULTIPLIER: f32 = 2.0;

/// Retry policy for handler invocations and store writes.
///
/// Only errors classified transient by [`SagaError::is_transient`] are
/// retried. Everything else propagates on the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f32,
    /// Adds a random share of the base delay to each sleep.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            multiplier: DEFAULT_MULTIPLIER,
            jitter: true,
        }
    }
}

/// Emitted before each retry sleep.
#[derive(Debug)]
pub struct RetryEvent<'a> {
    /// The attempt that just failed, starting at 1.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Sleep before the next attempt.
    pub delay: Duration,
    pub error: &'a SagaError,
}

/// Receives retry events for one execution.
pub trait RetryObserver: Send + Sync {
    fn on_retry(&self, event: &RetryEvent<'_>);
}

impl<F> RetryObserver for F
where
    F: Fn(&RetryEvent<'_>) + Send + Sync,
{
    fn on_retry(&self, event: &RetryEvent<'_>) {
        self(event)
    }
}

/// Observer that ignores every event.
pub struct NoopObserver;

impl RetryObserver for NoopObserver {
    fn on_retry(&self, _event: &RetryEvent<'_>) {}
}

impl RetryPolicy {
    /// Creates a jittered policy with `max_attempts` total attempts.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The backoff schedule: one delay per retry, `max_attempts - 1` in total.
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.multiplier)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Runs `operation` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. The observer is
    /// called once per retry, before sleeping.
    pub async fn execute<T, F, Fut>(
        &self,
        mut operation: F,
        observer: &dyn RetryObserver,
    ) -> Result<T, SagaError>
    where
        F: FnMut(u32) -> Fut + Send,
        Fut: Future<Output = Result<T, SagaError>> + Send,
    {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.max_attempts;

        (|| operation(attempts.fetch_add(1, Ordering::SeqCst) + 1))
            .retry(self.backoff())
            .when(SagaError::is_transient)
            .notify(|error: &SagaError, delay: Duration| {
                observer.on_retry(&RetryEvent {
                    attempt: attempts.load(Ordering::SeqCst),
                    max_attempts,
                    delay,
                    error,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;
    use std::sync::Mutex;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = RetryPolicy::new(
            6,
            Duration::from_millis(100),
            Duration::from_millis(1_000),
        )
        .with_jitter(false);

        let delays: Vec<_> = policy.backoff().build().collect();

        assert_eq!(
            delays,
            [100, 200, 400, 800, 1_000].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn jitter_stays_within_one_delay() {
        let policy = RetryPolicy::new(
            4,
            Duration::from_millis(100),
            Duration::from_millis(400),
        );

        let delays: Vec<_> = policy.backoff().build().collect();

        assert_eq!(delays.len(), 3);
        for (delay, base) in delays.iter().zip([100, 200, 400]) {
            assert!(*delay >= Duration::from_millis(base), "{delay:?}");
            assert!(*delay < Duration::from_millis(base * 2), "{delay:?}");
        }
    }

    #[test]
    fn no_retry_has_no_delays() {
        assert_eq!(RetryPolicy::no_retry().backoff().build().count(), 0);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let seen = Mutex::new(Vec::new());
        let observer = |event: &RetryEvent<'_>| seen.lock().unwrap().push(event.attempt);

        let result = fast(3)
            .execute(
                move |_| async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(SagaError::transient("flaky"))
                    } else {
                        Ok(42)
                    }
                },
                &observer,
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = fast(5)
            .execute(
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(SagaError::handler("card declined"))
                },
                &NoopObserver,
            )
            .await;

        assert!(matches!(result, Err(SagaError::Handler(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let seen = Mutex::new(Vec::new());
        let observer = |event: &RetryEvent<'_>| seen.lock().unwrap().push(event.delay);

        let result: Result<(), _> = fast(4)
            .execute(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(SagaError::transient(format!("attempt {attempt}"))) }
                },
                &observer,
            )
            .await;

        assert_eq!(
            result.unwrap_err().to_string(),
            "Transient infrastructure error: attempt 4"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let delays = seen.lock().unwrap();
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|d| *d < Duration::from_millis(10)));
    }
}
