//! Logger setup for the refundry services.
//!
//! Two environment variables control output:
//!
//! - `RUST_LOG`: standard `tracing` filter directives. When unset, the
//!   service logs at INFO with the chattiest dependencies (sqlx statement
//!   logs, hyper/reqwest connection noise) turned down to WARN so refund
//!   executions stay readable.
//! - `LOG_FORMAT`: `json` emits one flattened JSON object per line for log
//!   shippers in deployments; any other value (or unset) emits the compact
//!   human-readable format.

// Enforce disallowed methods clippy lint
#![deny(clippy::disallowed_methods)]

use tracing_subscriber::filter::EnvFilter;

/// The filter applied when `RUST_LOG` is unset. Refund legs and the
/// estimate job log at INFO; the layers below them mostly don't need to.
const DEFAULT_DIRECTIVES: &str =
    "info,sqlx::query=warn,hyper=warn,reqwest=warn";

/// Errors from installing the global subscriber (usually: one is already
/// installed).
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Initialize the global `tracing` subscriber for a service binary.
///
/// Panics if a subscriber is already installed.
pub fn init() {
    try_init().expect("Failed to install the global logger");
}

/// Initialize the global subscriber for tests.
///
/// Does nothing unless `RUST_LOG` is set (test output stays quiet by
/// default), and never panics: parallel test threads race to install the
/// subscriber and all but one lose.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

/// Install the global subscriber, honoring `RUST_LOG` and `LOG_FORMAT`.
pub fn try_init() -> Result<(), InitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let wants_json = std::env::var("LOG_FORMAT")
        .is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if wants_json {
        builder.json().flatten_event(true).try_init()
    } else {
        builder.compact().try_init()
    }
}
