//! Tracing and logging (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::TracingConfig::from_env());
}

/// Tracing configuration (filters, output format).
pub mod tracing;
