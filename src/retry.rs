// src/retry.rs
//! Bounded retry with linear backoff for rate-limited remote calls.
//!
//! Every remote call made by the pipeline goes through [`RetryPolicy::run`]
//! (or its cancellable variant); no call site carries its own retry loop.

use std::future::Future;
use std::time::Duration;

use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::CoachError;

/// Decide whether an error is a rate-limit/quota condition worth retrying.
///
/// Only errors reported by the remote API are considered, and the decision
/// is a case-insensitive substring match for `"quota"` or `"rate"` on the
/// remote message. The match is deliberately textual: a remote message such
/// as "generateContent is not supported" also matches ("gene-rate"), so such
/// errors are retried until the attempt budget runs out. Local errors
/// (validation, timeout, cancellation, processing failure) never match.
pub fn is_rate_limit_error(err: &CoachError) -> bool {
    match err {
        CoachError::Api { message, .. } => {
            let lower = message.to_lowercase();
            lower.contains("quota") || lower.contains("rate")
        }
        _ => false,
    }
}

/// Attempt budget and backoff schedule for one wrapped call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

/// Per-call bookkeeping; lives only for the duration of one wrapped call.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    last_error: Option<String>,
    next_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay slept after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Total time slept when `retries` retries are needed.
    pub fn total_backoff(&self, retries: u32) -> Duration {
        (1..=retries).map(|attempt| self.delay_for(attempt)).sum()
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, CoachError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoachError>>,
    {
        self.run_cancellable(operation, &CancellationToken::new(), call)
            .await
    }

    /// Run `call`, retrying rate-limited failures up to the attempt budget.
    ///
    /// Non rate-limit errors propagate on first occurrence. After the budget
    /// is spent the last error propagates unchanged. Cancellation is observed
    /// before each attempt and during backoff, never inside a call.
    pub async fn run_cancellable<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T, CoachError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoachError>>,
    {
        let mut state = RetryState::default();

        loop {
            if cancel.is_cancelled() {
                return Err(CoachError::Cancelled);
            }
            state.attempt += 1;

            let err = match call().await {
                Ok(value) => {
                    if state.attempt > 1 {
                        info!(
                            "[Retry] {} succeeded on attempt {}/{}",
                            operation, state.attempt, self.max_attempts
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !is_rate_limit_error(&err) {
                error!("[Retry] {} failed: {}", operation, err);
                return Err(err);
            }

            if state.attempt >= self.max_attempts {
                warn!(
                    "[Retry] {} still rate limited after {} attempts: {}",
                    operation, state.attempt, err
                );
                return Err(err);
            }

            state.next_delay = self.delay_for(state.attempt);
            state.last_error = Some(err.to_string());
            warn!(
                "[Retry] {} hit API rate limit, retrying in {:?} (attempt {}/{}): {}",
                operation,
                state.next_delay,
                state.attempt,
                self.max_attempts,
                state.last_error.as_deref().unwrap_or_default()
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(CoachError::Cancelled),
                _ = tokio::time::sleep(state.next_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quota_error() -> CoachError {
        CoachError::Api {
            status: 429,
            message: "Resource has been exhausted (e.g. check quota).".into(),
        }
    }

    #[test]
    fn classifies_quota_and_rate_messages() {
        assert!(is_rate_limit_error(&quota_error()));
        assert!(is_rate_limit_error(&CoachError::Api {
            status: 429,
            message: "Rate limit reached".into(),
        }));
        assert!(!is_rate_limit_error(&CoachError::Api {
            status: 400,
            message: "Invalid argument".into(),
        }));
        assert!(!is_rate_limit_error(&CoachError::Timeout("quota".into())));
        assert!(!is_rate_limit_error(&CoachError::Transport("rate".into())));
    }

    #[test]
    fn backoff_grows_with_attempt_number() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.total_backoff(2), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt_after_full_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = policy
            .run("generate", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(quota_error())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), policy.total_backoff(2));
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = policy
            .run("generate", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(CoachError::Api {
                        status: 400,
                        message: "Invalid argument".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(CoachError::Api { status: 400, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_returns_last_error() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = policy
            .run("upload", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(CoachError::Api {
                        status: 429,
                        message: format!("quota exceeded #{}", n),
                    })
                }
            })
            .await;

        match result {
            Err(CoachError::Api { message, .. }) => assert_eq!(message, "quota exceeded #3"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result: Result<(), _> = policy
            .run_cancellable("generate", &cancel, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(quota_error())
                }
            })
            .await;

        assert!(matches!(result, Err(CoachError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
