//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::rest::RestError;

/// Backoff for platform REST connection at startup.
///
/// - Min delay: 1s
/// - Max delay: 60s
/// - Max attempts: `max_connection_retries`, unbounded when zero or negative
/// - Jitter enabled
pub fn platform_backoff(max_connection_retries: i32) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(60))
        .with_jitter();
    match usize::try_from(max_connection_retries) {
        Ok(max) if max > 0 => builder.with_max_times(max),
        _ => builder.with_max_times(usize::MAX),
    }
}

/// Determines if a platform REST error is worth retrying.
///
/// Retryable:
/// - connect and timeout failures
/// - `429` and `5xx` responses
///
/// Non-retryable: authentication and org resolution failures, which need a
/// configuration change.
pub fn is_retryable_rest(err: &RestError) -> bool {
    match err {
        RestError::Http(e) => e.is_connect() || e.is_timeout(),
        RestError::Status { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}
