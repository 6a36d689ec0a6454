//! Installs the process-wide `tracing` subscriber.
//!
//! Every component logs through the `tracing` facade directly; this module's
//! only job is to wire up a formatter once at startup (or in a test harness).

use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber` formatter reading level filters from
/// `RUST_LOG`, defaulting to `info` when unset.
///
/// Safe to call more than once in a process (e.g. across tests run in the
/// same binary); subsequent calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
