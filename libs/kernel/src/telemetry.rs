//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::KernelConfig;

/// Installs the global subscriber: `RUST_LOG` when set, otherwise the
/// configured level, formatted as JSON.
///
/// Panics if a global subscriber is already installed, like any
/// `tracing_subscriber` `init`; embedders that own logging skip this.
pub fn init(config: &KernelConfig) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Idempotent variant for tests; output goes through the test writer.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
