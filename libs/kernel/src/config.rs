//! Configuration for the kernel.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::governance::DeactivationStrategy;

/// Kernel configuration.
///
/// Loaded from `FERRULE_*` environment variables, or deserialized from an
/// embedder's own configuration file. Missing values fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Worker threads for teams declared without an explicit size.
    pub default_team_threads: usize,

    /// Grace period when a worker team stops, in milliseconds.
    pub team_shutdown_timeout_ms: u64,

    /// Deactivation strategy for governance declared without one.
    pub governance_deactivation: DeactivationStrategy,

    /// Timeout for asynchronous resources, in milliseconds (0 = none).
    pub resource_timeout_ms: u64,

    /// Default capacity for bounded pools.
    pub pool_max_size: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            default_team_threads: 4,
            team_shutdown_timeout_ms: 5_000,
            governance_deactivation: DeactivationStrategy::Immediate,
            resource_timeout_ms: 0,
            pool_max_size: 16,
            log_level: "info".to_string(),
        }
    }
}

impl KernelConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let default_team_threads = match lookup("FERRULE_DEFAULT_TEAM_THREADS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid FERRULE_DEFAULT_TEAM_THREADS: {raw}"))?,
            None => defaults.default_team_threads,
        };
        if default_team_threads == 0 {
            anyhow::bail!("FERRULE_DEFAULT_TEAM_THREADS must be at least 1");
        }

        let team_shutdown_timeout_ms = match lookup("FERRULE_TEAM_SHUTDOWN_TIMEOUT_MS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid FERRULE_TEAM_SHUTDOWN_TIMEOUT_MS: {raw}"))?,
            None => defaults.team_shutdown_timeout_ms,
        };

        let governance_deactivation = match lookup("FERRULE_GOVERNANCE_DEACTIVATION") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid FERRULE_GOVERNANCE_DEACTIVATION: {raw}"))?,
            None => defaults.governance_deactivation,
        };

        let resource_timeout_ms = match lookup("FERRULE_RESOURCE_TIMEOUT_MS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid FERRULE_RESOURCE_TIMEOUT_MS: {raw}"))?,
            None => defaults.resource_timeout_ms,
        };

        let pool_max_size = match lookup("FERRULE_POOL_MAX_SIZE") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid FERRULE_POOL_MAX_SIZE: {raw}"))?,
            None => defaults.pool_max_size,
        };

        let log_level = lookup("FERRULE_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            default_team_threads,
            team_shutdown_timeout_ms,
            governance_deactivation,
            resource_timeout_ms,
            pool_max_size,
            log_level,
        })
    }

    /// Grace period for team shutdown.
    pub fn team_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.team_shutdown_timeout_ms)
    }

    /// Default asynchronous resource timeout, if any.
    pub fn resource_timeout(&self) -> Option<Duration> {
        (self.resource_timeout_ms > 0).then(|| Duration::from_millis(self.resource_timeout_ms))
    }
}
