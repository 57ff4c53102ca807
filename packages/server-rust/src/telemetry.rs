//! Tracing setup for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber: env-filtered (`RUST_LOG`),
/// compact output. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .try_init();
}
