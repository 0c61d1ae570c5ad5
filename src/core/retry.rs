//! Bounded retry for calls to external providers.
//!
//! Each attempt runs under its own timeout, transient failures back off
//! exponentially (backon), and the whole sequence is capped by an attempt
//! count and an absolute request deadline. Cancellation is observed both
//! while a call is in flight and while sleeping between attempts.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::errors::{EngineError, EngineResult, ProviderError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single external call.
    pub call_timeout: Duration,
    /// Upper bound for a whole estimation request.
    pub request_deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            call_timeout: Duration::from_secs(60),
            request_deadline: Duration::from_secs(180),
        }
    }
}

impl RetryPolicy {
    pub fn deadline_from_now(&self) -> Instant {
        Instant::now() + self.request_deadline
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
            .with_jitter()
            .build()
    }

    /// Run `call` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// Exhausting attempts or the deadline yields `EstimationUnavailable`;
    /// a permanent provider error is returned as-is on the first occurrence.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        deadline: Instant,
        cancel: &CancellationToken,
        mut call: F,
    ) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut delays = self.backoff();
        let mut attempts: u32 = 0;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(unavailable(operation, attempts, "request deadline exceeded"));
            }
            attempts += 1;
            let budget = self.call_timeout.min(deadline - now);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                res = tokio::time::timeout(budget, call()) => res,
            };

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if !err.is_transient() => return Err(EngineError::Provider(err)),
                Ok(Err(err)) => err,
                Err(_) => ProviderError::transient(format!(
                    "timed out after {}ms",
                    budget.as_millis()
                )),
            };

            let Some(delay) = delays.next() else {
                return Err(unavailable(operation, attempts, &err.message));
            };
            if Instant::now() + delay >= deadline {
                return Err(unavailable(
                    operation,
                    attempts,
                    &format!("deadline reached while backing off: {}", err.message),
                ));
            }

            tracing::warn!(
                operation,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "transient provider failure, retrying: {}",
                err.message
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn unavailable(operation: &str, attempts: u32, reason: &str) -> EngineError {
    EngineError::EstimationUnavailable {
        operation: operation.to_string(),
        attempts,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            call_timeout: Duration::from_secs(1),
            request_deadline: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(4);
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let value = policy
            .run("embed", policy.deadline_from_now(), &cancel, || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::transient("rate limited"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_become_estimation_unavailable() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(3);
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let err = policy
            .run("generate", policy.deadline_from_now(), &cancel, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ProviderError::transient("503")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            EngineError::EstimationUnavailable {
                operation,
                attempts,
                ..
            } => {
                assert_eq!(operation, "generate");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = fast_policy(5);
        let cancel = CancellationToken::new();

        let counter = calls.clone();
        let err = policy
            .run("analyze", policy.deadline_from_now(), &cancel, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ProviderError::permanent("unreadable drawing")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, EngineError::Provider(ref e) if !e.is_transient()));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_respect_the_deadline() {
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(100),
            request_deadline: Duration::from_millis(250),
            ..fast_policy(10)
        };
        let cancel = CancellationToken::new();

        let err = policy
            .run("analyze", policy.deadline_from_now(), &cancel, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ProviderError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::EstimationUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting_for_the_call() {
        let policy = fast_policy(3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = policy
            .run("generate", policy.deadline_from_now(), &cancel, || async {
                tokio::time::sleep(Duration::from_millis(900)).await;
                Ok::<_, ProviderError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Cancelled));
    }
}
