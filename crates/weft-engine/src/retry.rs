use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::types::{
    EngineEvent, FailureKind, RetryPolicy, TaskFailure, TaskIdentity, TaskOutcome, TaskSnapshot,
    TaskState,
};

use crate::registry::TaskFunction;
use crate::scope::TaskContext;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { backoff: Duration },
    GiveUp,
}

/// Decide whether another attempt is allowed after `attempts_made` attempts.
pub fn decide(policy: &RetryPolicy, attempts_made: u32) -> RetryDecision {
    if attempts_made < policy.max_attempts() {
        RetryDecision::Retry {
            backoff: calculate_backoff(attempts_made.saturating_sub(1), policy),
        }
    } else {
        RetryDecision::GiveUp
    }
}

/// Exponential backoff for the `retry`-th retry (0-based), with 0.8x to 1.2x
/// jitter, capped at the policy maximum.
pub fn calculate_backoff(retry: u32, policy: &RetryPolicy) -> Duration {
    let initial = policy.initial_backoff_ms.unwrap_or(0);
    let max = policy.max_backoff_ms.unwrap_or(initial);
    let ms = initial
        .saturating_mul(2u64.saturating_pow(retry))
        .min(max);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis(((ms as f64 * jitter) as u64).min(max))
}

/// Run one attempt in its own tokio task, bounded by `timeout`.
///
/// The body is aborted when the timeout fires. A panicking body counts as a
/// runtime failure of the attempt.
pub(crate) async fn run_attempt(
    body: Arc<dyn TaskFunction>,
    input: Value,
    ctx: TaskContext,
    timeout: Duration,
) -> Result<Value> {
    let handle = tokio::spawn(async move { body.execute(input, ctx).await });
    let abort = handle.abort_handle();

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) if e.is_retryable() => Err(e),
        Ok(Ok(Err(e))) => Err(WeftError::TaskRuntime(e.to_string())),
        Ok(Err(join_err)) if join_err.is_panic() => {
            Err(WeftError::runtime("task body panicked"))
        }
        Ok(Err(_)) => Err(WeftError::runtime("task body was cancelled")),
        Err(_) => {
            abort.abort();
            Err(WeftError::TaskTimeout {
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

/// Drives the attempts of one task until success or the retry budget runs out.
pub(crate) struct Supervisor<'a> {
    pub identity: &'a TaskIdentity,
    pub body: Arc<dyn TaskFunction>,
    pub policy: &'a RetryPolicy,
    pub timeout: Duration,
    pub events: &'a EventBus,
    pub observer: Option<&'a watch::Sender<TaskSnapshot>>,
}

impl Supervisor<'_> {
    /// Returns the terminal outcome and the number of attempts made.
    pub(crate) async fn run<C>(&self, input: Value, context: C) -> (TaskOutcome, u32)
    where
        C: Fn(u32) -> TaskContext,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.observe(TaskState::Running, attempt);
            self.events.publish(EngineEvent::TaskStarted {
                identity: self.identity.clone(),
                attempt,
            });

            let started = Instant::now();
            let error = match run_attempt(
                self.body.clone(),
                input.clone(),
                context(attempt),
                self.timeout,
            )
            .await
            {
                Ok(value) => {
                    debug!(
                        task = %self.identity,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Attempt succeeded"
                    );
                    return (TaskOutcome::success(value), attempt);
                }
                Err(e) => e,
            };

            let timed_out = matches!(error, WeftError::TaskTimeout { .. });
            warn!(
                task = %self.identity,
                attempt,
                timed_out,
                error = %error,
                "Attempt failed"
            );
            self.events.publish(EngineEvent::TaskAttemptFailed {
                identity: self.identity.clone(),
                attempt,
                error: error.to_string(),
                timed_out,
            });

            match decide(self.policy, attempt) {
                RetryDecision::Retry { backoff } => {
                    self.observe(TaskState::Retrying, attempt);
                    self.events.publish(EngineEvent::TaskRetrying {
                        identity: self.identity.clone(),
                        next_attempt: attempt + 1,
                        backoff_ms: backoff.as_millis() as u64,
                    });
                    tokio::time::sleep(backoff).await;
                }
                RetryDecision::GiveUp => {
                    let failure = TaskFailure::new(
                        FailureKind::RetriesExhausted,
                        error.to_string(),
                        attempt,
                    );
                    return (TaskOutcome::failure(failure), attempt);
                }
            }
        }
    }

    fn observe(&self, state: TaskState, attempt: u32) {
        if let Some(observer) = self.observer {
            observer.send_modify(|s| {
                s.state = state;
                s.attempts = attempt;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy::new(retries).with_backoff(100, 1_000)
    }

    #[test]
    fn test_decide_allows_r_plus_one_attempts() {
        let p = policy(2);
        assert!(matches!(decide(&p, 1), RetryDecision::Retry { .. }));
        assert!(matches!(decide(&p, 2), RetryDecision::Retry { .. }));
        assert_eq!(decide(&p, 3), RetryDecision::GiveUp);
        assert_eq!(decide(&policy(0), 1), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy(10);
        for _ in 0..20 {
            let first = calculate_backoff(0, &p).as_millis() as u64;
            assert!((80..=120).contains(&first), "first backoff {}", first);

            let third = calculate_backoff(2, &p).as_millis() as u64;
            assert!((320..=480).contains(&third), "third backoff {}", third);

            let capped = calculate_backoff(9, &p).as_millis() as u64;
            assert!(capped <= 1_000);
            assert!(capped >= 800);
        }
    }

    #[test]
    fn test_backoff_zero_initial() {
        let p = RetryPolicy::new(3).with_backoff(0, 0);
        assert_eq!(calculate_backoff(5, &p), Duration::ZERO);
    }

    #[test]
    fn test_backoff_huge_retry_does_not_overflow() {
        let p = policy(100);
        assert!(calculate_backoff(80, &p) <= Duration::from_millis(1_000));
    }
}
