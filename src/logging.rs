//! Log subscriber setup for the binary.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `fmt` subscriber. `RUST_LOG` wins over `level` when set.
/// Returns false if a subscriber was already installed.
pub fn init(level: &str) -> bool {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info")),
    };
    fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
}
