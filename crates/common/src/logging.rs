//! Tracing subscriber setup shared by every binary embedding the agent.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to the
/// configured level. Returns false if a global subscriber was already set.
pub fn init_tracing(cfg: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
