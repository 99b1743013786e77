//! soarlink: connector runtime
//!
//! Connects to the platform, subscribes the configured message destinations
//! and dispatches invocations to the registered components.
//!
//! ## Configuration
//! - APP_CONFIG_FILE: path to `app.config` (default `~/.resilient/app.config`)
//! - APP_HOST_CONTAINER: enables protected secrets under `/etc/secrets`
//! - APP__<SECTION>__<KEY>: overrides a single option
//! - SOARLINK_LOG: tracing filter (default `info`)
//!
//! Exit code 34 means heartbeat timeouts outlasted `heartbeat_timeout_threshold`.

use std::process::ExitCode;

use tracing::{error, info};

use soarlink::app;
use soarlink::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    info!(version = env!("CARGO_PKG_VERSION"), "Starting soarlink");

    match app::run(Vec::new()).await {
        Ok(()) => {
            info!("soarlink stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "soarlink failed");
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}
