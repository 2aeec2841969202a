//! Retry wrapper around seller requests.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clients::{ClientError, RatingsPage, RatingsQuery, SellerApi};
use crate::config::SyncConfig;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per page, including the first
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            attempts: config.page_retry_attempts.max(1),
            backoff: Duration::from_millis(config.page_retry_backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(3),
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Runs `op` until it succeeds, retrying retryable failures with a fixed
/// backoff. Non-retryable failures return at once; exhausted retries return
/// the last failure. Both surface as [`PipelineError::Remote`].
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = op() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) => {
                metrics::counter!("seller_page_fetch_failures_total", "kind" => e.kind())
                    .increment(1);
                if !e.is_retryable() || attempt >= policy.attempts {
                    return Err(e.into());
                }
                warn!(what, attempt, error = %e, "Seller request failed; retrying");
                sleep_cancellable(policy.backoff, cancel).await?;
                attempt += 1;
            }
        }
    }
}

/// Fetches one ratings page under [`with_retry`].
pub async fn fetch_with_retry(
    seller: &dyn SellerApi,
    query: &RatingsQuery,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<RatingsPage, PipelineError> {
    let what = format!(
        "connection {} page {}",
        query.connection_id, query.page_number
    );
    with_retry(policy, cancel, &what, || seller.fetch_ratings(query)).await
}
