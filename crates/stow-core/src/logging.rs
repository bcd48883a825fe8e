//! Tracing setup for native hosts and test binaries.
//!
//! The browser bridge installs its own console subscriber instead.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a compact subscriber filtered at "info" (`RUST_LOG` wins).
pub fn init() -> bool {
    init_with_filter("info")
}

/// Install a compact subscriber with `default_filter` unless `RUST_LOG` is set.
///
/// Returns false when a global subscriber was already installed.
pub fn init_with_filter(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt::layer().compact())
        .try_init()
        .is_ok()
}

/// Same as [`init_with_filter`], but output goes through the test harness
/// so it only shows for failing tests.
pub fn init_for_tests(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(fmt::layer().compact().with_test_writer())
        .try_init()
        .is_ok()
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Segment prefixes for log lines.
pub mod prefix {
    /// Database lifecycle (open, upgrade, close, delete)
    pub const DB: &str = "⊔";
    /// Record requests (add, cursor, getAll, delete)
    pub const REQUEST: &str = "⇄";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_refused() {
        init_for_tests("debug");
        assert!(!init_for_tests("debug"));
        assert!(!init());
    }
}
