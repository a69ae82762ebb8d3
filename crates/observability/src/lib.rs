//! Process-wide logging setup shared by the API and worker binaries.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::DEFAULT_FILTER;

/// Initialize structured JSON logging.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    self::tracing::init(DEFAULT_FILTER);
}
