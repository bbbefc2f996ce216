//! Tracing/logging setup shared by every service process.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use crate::tracing::{LogConfig, LogFormat, ObservabilityError};

/// Initialize process-wide tracing with JSON output and `RUST_LOG` filtering
/// (default `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
///
/// Call it first thing in a service's `main`:
///
/// ```
/// courier_observability::init();
/// courier_observability::init();
/// ```
pub fn init() {
    crate::tracing::init(&LogConfig::from_env());
}
