//! Bootstrap utilities for the soarlink binary.

use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use super::retry::is_retryable_rest;
use crate::rest::{self, OrgContext, PlatformApi};

/// Environment variable holding the tracing filter.
pub const LOG_ENV_VAR: &str = "SOARLINK_LOG";

/// Initialize tracing with SOARLINK_LOG environment variable.
///
/// Defaults to "info" level if SOARLINK_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Authenticate against the platform, retrying transient failures.
pub async fn connect_platform(
    api: &dyn PlatformApi,
    backoff: ExponentialBuilder,
) -> rest::Result<OrgContext> {
    let org = (|| async { api.connect().await })
        .retry(backoff)
        .when(is_retryable_rest)
        .notify(|err: &rest::RestError, dur: Duration| {
            warn!(error = %err, delay = ?dur, "Platform connection failed, retrying");
        })
        .await?;
    info!(org_id = org.org_id, org = %org.org_name, "Connected to platform");
    Ok(org)
}
