// src/logging.rs

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the level
/// picked from `verbose`.
pub fn init(verbose: bool) {
    let level = if verbose { "tubegrab=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A second call (tests, embedding apps) keeps the first subscriber.
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
