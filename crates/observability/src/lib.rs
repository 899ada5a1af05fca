//! Tracing/logging setup shared by the API server and worker processes.

/// Initialize process-wide JSON logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize logging, choosing human-readable TRACE output when `debug` is set.
pub fn init_with(debug: bool) {
    if debug {
        tracing::init_pretty();
    } else {
        tracing::init();
    }
}

/// Tracing configuration (filters, layers).
pub mod tracing;
