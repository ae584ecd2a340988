//! Tracing and logging setup shared by the service binaries.

/// Tracing configuration (filters, formats).
pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};

/// Initialize process-wide logging with the given format.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: LogConfig) {
    self::tracing::init(&config);
}
