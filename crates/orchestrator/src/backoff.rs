//! Shared retry policy for transient failures encountered while driving a
//! stack orchestrator stage: exponential backoff, base 1s, cap 30s, at
//! most 6 attempts, retried only for [`ControlPlaneError::kind`] ==
//! [`ErrorKind::Transient`]. Every other error surfaces immediately.

use backon::{ExponentialBuilder, Retryable};
use popsigner_core::{ControlPlaneError, ErrorKind};
use popsigner_metrics::OrchestratorMetrics;
use std::future::Future;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: usize = 6;

fn policy() -> ExponentialBuilder {
    ExponentialBuilder::default().with_min_delay(BASE_DELAY).with_max_delay(MAX_DELAY).with_max_times(MAX_ATTEMPTS).with_jitter()
}

/// Runs `op`, retrying with exponential backoff only while the returned
/// error is [`ErrorKind::Transient`]. Non-transient errors (revert, nonce
/// too low, insufficient funds, …) propagate on the first attempt.
pub async fn retry_transient<T, F, Fut>(metrics: &OrchestratorMetrics, op: F) -> Result<T, ControlPlaneError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControlPlaneError>>,
{
    let metrics = metrics.clone();
    op.retry(policy())
        .when(move |err: &ControlPlaneError| {
            let transient = err.kind() == ErrorKind::Transient;
            if transient {
                metrics.retry_attempts_total.increment(1);
            }
            transient
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let metrics = OrchestratorMetrics::new();
        let attempts = AtomicUsize::new(0);

        let result = retry_transient(&metrics, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ControlPlaneError::Transient("rpc blip".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient() {
        let metrics = OrchestratorMetrics::new();
        let attempts = AtomicUsize::new(0);

        let result: Result<i32, _> = retry_transient(&metrics, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(ControlPlaneError::BadRequest("nonce too low".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
