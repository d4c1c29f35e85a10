//! Configuration for the agent world service.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use magick_reconcile::{
    PortRange, DEFAULT_OPERATION_TIMEOUT, DEFAULT_PORT_RANGE, DEFAULT_RECONCILE_INTERVAL,
};

use crate::orchestrator::OrchestratorConfig;
use crate::reconciler::ReconcilerConfig;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ports handed to workers (either bound order).
    pub port_range: PortRange,

    /// Interval between reconciliation ticks.
    pub poll_interval: Duration,

    /// Bound on each store call, worker start/stop and graph load.
    pub operation_timeout: Duration,

    /// JSON seed for the in-memory store.
    pub seed_file: Option<PathBuf>,

    /// Empty every agent's spell list once at startup.
    pub reset_spells_on_start: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_range: DEFAULT_PORT_RANGE,
            poll_interval: DEFAULT_RECONCILE_INTERVAL,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            seed_file: None,
            reset_spells_on_start: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
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

        let port_range = match lookup("MAGICK_PORT_RANGE") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("MAGICK_PORT_RANGE={raw}"))?,
            None => defaults.port_range,
        };

        let poll_interval = lookup("MAGICK_POLL_INTERVAL_MS")
            .map(|raw| {
                raw.parse::<u64>()
                    .with_context(|| format!("MAGICK_POLL_INTERVAL_MS={raw}"))
            })
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        if poll_interval.is_zero() {
            anyhow::bail!("MAGICK_POLL_INTERVAL_MS must be greater than zero");
        }

        let operation_timeout = lookup("MAGICK_OPERATION_TIMEOUT_SECS")
            .map(|raw| {
                raw.parse::<u64>()
                    .with_context(|| format!("MAGICK_OPERATION_TIMEOUT_SECS={raw}"))
            })
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(defaults.operation_timeout);

        let seed_file = lookup("MAGICK_SEED_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let reset_spells_on_start = lookup("MAGICK_RESET_SPELLS_ON_START")
            .map(|raw| matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.reset_spells_on_start);

        let log_level = lookup("MAGICK_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            port_range,
            poll_interval,
            operation_timeout,
            seed_file,
            reset_spells_on_start,
            log_level,
        })
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            ports: self.port_range,
            operation_timeout: self.operation_timeout,
        }
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: self.poll_interval,
        }
    }
}
