//! In-process retry for units of work.
//!
//! [`Retrying`] wraps any [`Task`] and re-invokes `execute` under a
//! [`RetryPolicy`] until it succeeds, the attempts run out, or the task
//! fails with a [`Permanent`] error. Only the final error reaches the
//! caller.
//!
//! This is independent of the verification scheduler's attempt counting,
//! which is persisted per task across polls. The retry here lives inside a
//! single call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use case_ingest_core::execution::ExecutionRecord;

use crate::config::RetryConfig;
use crate::traits::Task;

/// Marks an error as not worth retrying.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Permanent(pub String);

/// Builds an [`anyhow::Error`] that [`Retrying`] will not retry.
pub fn permanent(msg: impl Into<String>) -> anyhow::Error {
    Permanent(msg.into()).into()
}

/// `false` when any error in the chain is [`Permanent`].
pub fn is_recoverable(err: &anyhow::Error) -> bool {
    !err.chain().any(|e| e.is::<Permanent>())
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.multiplier,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retry number `retry` (1-based):
    /// `initial * multiplier^(retry-1)`, capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Runs `op` under `policy`. `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_recoverable(&e) => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    unit = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{:#}", e),
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry decorator for any [`Task`].
pub struct Retrying {
    inner: Arc<dyn Task>,
    policy: RetryPolicy,
}

impl Retrying {
    pub fn new(inner: Arc<dyn Task>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Task for Retrying {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, record: &ExecutionRecord) -> Result<Value> {
        let inner = &self.inner;
        retry(&self.policy, inner.name(), |_| inner.execute(record)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use case_ingest_core::execution::JobParameters;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `failures` times, then succeeds with the call count.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        permanent: bool,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                permanent: false,
            }
        }
    }

    #[async_trait]
    impl Task for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _record: &ExecutionRecord) -> Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                if self.permanent {
                    return Err(permanent("bad input"));
                }
                anyhow::bail!("transient failure {}", n);
            }
            Ok(Value::from(n))
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            ..RetryPolicy::none()
        }
    }

    fn record() -> ExecutionRecord {
        ExecutionRecord::new("flaky", "run-1", JobParameters::new())
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let inner = Arc::new(Flaky::new(2));
        let task = Retrying::new(inner.clone(), fast(3));
        let out = task.execute(&record()).await.unwrap();
        assert_eq!(out, Value::from(3));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_only_final_failure() {
        let inner = Arc::new(Flaky::new(10));
        let task = Retrying::new(inner.clone(), fast(3));
        let err = task.execute(&record()).await.unwrap_err();
        assert_eq!(err.to_string(), "transient failure 3");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let inner = Arc::new(Flaky {
            permanent: true,
            ..Flaky::new(5)
        });
        let task = Retrying::new(inner.clone(), fast(5));
        let err = task.execute(&record()).await.unwrap_err();
        assert!(!is_recoverable(&err));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_survives_added_context() {
        let err = permanent("nope").context("while doing work");
        assert!(!is_recoverable(&err));
    }

    #[tokio::test]
    async fn retry_helper_passes_attempt_number() {
        let seen = std::sync::Mutex::new(Vec::new());
        let result: Result<u32> = retry(&fast(3), "closure", |attempt| {
            seen.lock().unwrap().push(attempt);
            async move {
                if attempt < 3 {
                    anyhow::bail!("not yet")
                }
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
    }

    #[test]
    fn from_config_never_allows_zero_attempts() {
        let config = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
