//! Tracing and logging setup shared by the engine binaries.

/// Initialize process-wide tracing with the defaults (JSON, `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::default());
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogConfig;
