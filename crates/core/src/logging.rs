//! Structured logging infrastructure for SecureMesh.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter directive when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Initialize the logging system with human-readable output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, `fallback` is used (see [`DEFAULT_FILTER`]).
///
/// # Example
/// ```no_run
/// use securemesh_core::logging;
///
/// logging::init(logging::DEFAULT_FILTER);
/// tracing::info!("node started");
/// ```
pub fn init(fallback: &str) {
    tracing_subscriber::registry()
        .with(env_filter(fallback))
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

/// Initialize the logging system with JSON output for production environments.
///
/// This format is suitable for log aggregation systems and structured log analysis.
///
/// # Example
/// ```no_run
/// use securemesh_core::logging;
///
/// logging::init_json("securemesh_mesh=debug,info");
/// tracing::info!(node_id = "node-1", "node started");
/// ```
pub fn init_json(fallback: &str) {
    tracing_subscriber::registry()
        .with(env_filter(fallback))
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_filter_parses() {
        // The global subscriber can only be installed once per process, so only
        // the filter construction is exercised here.
        let filter = EnvFilter::new("securemesh_mesh=debug,info");
        assert!(filter.to_string().contains("securemesh_mesh=debug"));
        let _ = env_filter(DEFAULT_FILTER);
    }
}
