//! Retry of database operations.
//!
//! Every wait in the bootstrap sequence funnels through `retry`: connection attempts, waiting on
//! peers and subscription management. Delays grow exponentially up to a cap. Errors classified
//! as permanent abort the loop immediately unless the caller asks for every error to be retried.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::DbError;

/// Backoff parameters applied to a retried operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// The maximum number of retries, `None` meaning unbounded.
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_attempts.unwrap_or(usize::MAX))
            .with_jitter()
    }
}

/// Which errors a retry loop should retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryOn {
    /// Only errors classified as transient.
    Transient,
    /// Every error, regardless of classification.
    AnyError,
}

/// Run the given operation until it succeeds, it fails permanently, or the policy is exhausted.
///
/// Each failed attempt which will be retried is logged along with `what`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, on: RetryOn, what: &str, op: F) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    let res = op
        .retry(policy.backoff())
        .when(|err: &DbError| on == RetryOn::AnyError || err.is_transient())
        .notify(|err: &DbError, delay: Duration| {
            tracing::warn!(error = %err, code = ?err.code, delay = ?delay, "{}, retrying", what);
        })
        .await;
    if let Err(err) = &res {
        tracing::error!(error = %err, code = ?err.code, kind = ?err.kind, "{}, giving up", what);
    }
    res
}
