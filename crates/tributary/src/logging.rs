//! Tracing subscriber setup for binaries embedding the pipeline.
//!
//! The library only emits events; installing a subscriber is left to the
//! process that runs the sync.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, falling back
/// to `default_directive`.
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_ok()
}
