//! Tracing and logging setup shared by every forgelist process.

/// Tracing configuration (filters, layers, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, UnknownLogFormat};

/// Initialize process-wide logging.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Logging for tests: pretty output through the test harness writer.
pub fn init_for_tests() {
    tracing::init_for_tests();
}
