//! Retry kernel for remote calls. Two policies cover the two call
//! classes: normal calls get a short exponential budget with an
//! interactive timeout-doubling escape hatch, judge calls get a long
//! linear ramp and never prompt. All waits are cancellable.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    Exponential,
    LinearRamp,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff: Backoff,
    /// Whether an exhausted all-timeout budget consults the arbiter
    /// instead of failing outright.
    prompt_on_timeout: bool,
}

impl RetryPolicy {
    /// Inference, pull, show, list: 5 attempts, capped exponential.
    pub fn normal() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            backoff: Backoff::Exponential,
            prompt_on_timeout: true,
        }
    }

    /// Judge calls: 25 attempts, delay ramping linearly 5 s → 30 s.
    /// Permanent failure is the caller's problem (skip with warning).
    pub fn judge_extended() -> Self {
        Self {
            max_attempts: 25,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::LinearRamp,
            prompt_on_timeout: false,
        }
    }

    /// Delay before the next attempt, `attempt` counting from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(1 << 16);
                (self.base_delay * factor).min(self.max_delay)
            }
            Backoff::LinearRamp => {
                let span = self.max_delay.saturating_sub(self.base_delay);
                let steps = self.max_attempts.saturating_sub(1).max(1);
                let step = attempt.saturating_sub(1).min(steps);
                self.base_delay + span.mul_f64(f64::from(step) / f64::from(steps))
            }
        }
    }

    #[cfg(test)]
    fn fast(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff: Backoff::Exponential,
            prompt_on_timeout: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    /// Double the per-request budget and restart the retry budget.
    ExtendAndRetry,
    Abort,
}

/// Decides what happens when a whole retry budget was eaten by timeouts.
/// The CLI implements this with a y/n prompt; non-interactive contexts
/// auto-extend.
#[async_trait]
pub trait TimeoutArbiter: Send + Sync {
    async fn on_repeated_timeouts(&self, op: &str, current: Duration) -> TimeoutVerdict;
}

pub struct AutoExtend;

#[async_trait]
impl TimeoutArbiter for AutoExtend {
    async fn on_repeated_timeouts(&self, op: &str, current: Duration) -> TimeoutVerdict {
        tracing::warn!(op, ?current, "repeated timeouts, extending request budget");
        TimeoutVerdict::ExtendAndRetry
    }
}

/// Shared wrapper for every remote call: per-request deadline linked to
/// the run-wide cancellation scope, kind-aware retries, dynamic timeout
/// doubling.
#[derive(Clone)]
pub struct CallKernel {
    cancel: CancellationToken,
    timeout_ms: Arc<AtomicU64>,
    arbiter: Arc<dyn TimeoutArbiter>,
}

impl CallKernel {
    pub fn new(
        cancel: CancellationToken,
        request_timeout: Duration,
        arbiter: Arc<dyn TimeoutArbiter>,
    ) -> Self {
        Self {
            cancel,
            timeout_ms: Arc::new(AtomicU64::new(request_timeout.as_millis() as u64)),
            arbiter,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::SeqCst))
    }

    fn double_timeout(&self) {
        self.timeout_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |ms| {
                Some(ms.saturating_mul(2))
            })
            .ok();
    }

    /// Run `f` under the policy. Retryable errors observed concurrently
    /// with a confirmed cancellation are not retried.
    pub async fn call<T, F, Fut>(
        &self,
        op: &str,
        policy: RetryPolicy,
        mut f: F,
    ) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 0u32;
        let mut all_timeouts = true;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            attempt += 1;
            let deadline = self.request_timeout();
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
                outcome = tokio::time::timeout(deadline, f()) => match outcome {
                    Ok(inner) => inner,
                    Err(_) => Err(ClientError::Timeout(deadline)),
                },
            };

            let err = match result {
                Ok(v) => return Ok(v),
                Err(e) if e.is_cancelled() || !e.is_retryable() => return Err(e),
                Err(e) => e,
            };
            all_timeouts = all_timeouts && err.is_timeout();

            if attempt >= policy.max_attempts {
                if policy.prompt_on_timeout && all_timeouts {
                    match self.arbiter.on_repeated_timeouts(op, deadline).await {
                        TimeoutVerdict::ExtendAndRetry => {
                            self.double_timeout();
                            attempt = 0;
                            all_timeouts = true;
                            continue;
                        }
                        TimeoutVerdict::Abort => return Err(ClientError::Cancelled),
                    }
                }
                return Err(err);
            }

            let delay = match &err {
                ClientError::RateLimited { reset: Some(d) } => *d,
                _ => policy.delay_for(attempt),
            };
            tracing::warn!(op, attempt, ?delay, error = %err, "retrying remote call");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn judge_delay_ramps_linearly() {
        let p = RetryPolicy::judge_extended();
        assert_eq!(p.delay_for(1), Duration::from_secs(5));
        assert_eq!(p.delay_for(25), Duration::from_secs(30));
        let mid = p.delay_for(13);
        assert!(mid > Duration::from_secs(15) && mid < Duration::from_secs(20));
    }

    #[test]
    fn normal_delay_is_capped_exponential() {
        let p = RetryPolicy::normal();
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_secs(1));
        assert_eq!(p.delay_for(10), Duration::from_secs(8));
    }

    fn kernel() -> CallKernel {
        CallKernel::new(
            CancellationToken::new(),
            Duration::from_secs(5),
            Arc::new(AutoExtend),
        )
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let out = kernel()
            .call("op", RetryPolicy::fast(5), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ClientError::Network("refused".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .expect("third attempt succeeds");
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = kernel()
            .call("op", RetryPolicy::fast(5), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ClientError::LogprobsUnavailable) }
            })
            .await
            .expect_err("permanent");
        assert!(matches!(err, ClientError::LogprobsUnavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_returns_last_error() {
        let err = kernel()
            .call("op", RetryPolicy::fast(3), || async {
                Err::<(), _>(ClientError::Network("down".into()))
            })
            .await
            .expect_err("exhausted");
        assert!(matches!(err, ClientError::Network(_)));
    }

    #[tokio::test]
    async fn cancelled_scope_stops_retries() {
        let cancel = CancellationToken::new();
        let kernel = CallKernel::new(cancel.clone(), Duration::from_secs(5), Arc::new(AutoExtend));
        cancel.cancel();
        let err = kernel
            .call("op", RetryPolicy::fast(5), || async { Ok::<_, ClientError>(1) })
            .await
            .expect_err("cancelled before first attempt");
        assert!(err.is_cancelled());
    }

    struct AbortArbiter;

    #[async_trait]
    impl TimeoutArbiter for AbortArbiter {
        async fn on_repeated_timeouts(&self, _op: &str, _cur: Duration) -> TimeoutVerdict {
            TimeoutVerdict::Abort
        }
    }

    #[tokio::test]
    async fn repeated_timeouts_consult_arbiter() {
        let kernel = CallKernel::new(
            CancellationToken::new(),
            Duration::from_millis(5),
            Arc::new(AbortArbiter),
        );
        let err = kernel
            .call("op", RetryPolicy::fast(2), || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, ClientError>(())
            })
            .await
            .expect_err("aborted by arbiter");
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn extend_doubles_request_timeout() {
        let kernel = kernel();
        let before = kernel.request_timeout();
        kernel.double_timeout();
        assert_eq!(kernel.request_timeout(), before * 2);
    }
}
