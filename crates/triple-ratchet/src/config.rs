//! Session configuration.
//!
//! Resolution order:
//! 1. Built-in defaults
//! 2. JSON config file (if given)
//! 3. Environment variables

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RatchetError, Result};
use crate::macro_ratchet::DEFAULT_ROTATION_INTERVAL;

/// Environment override for [`SessionConfig::rotation_interval_secs`].
pub const ENV_ROTATION_INTERVAL: &str = "TRIPLE_RATCHET_ROTATION_INTERVAL_SECS";
/// Environment override for [`SessionConfig::max_catch_up_epochs`].
pub const ENV_MAX_CATCH_UP: &str = "TRIPLE_RATCHET_MAX_CATCH_UP";
/// Environment override for [`SessionConfig::max_skipped_messages`].
pub const ENV_MAX_SKIP: &str = "TRIPLE_RATCHET_MAX_SKIP";

/// Tunables for a [`TripleSession`](crate::TripleSession) and its chain engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds after which the next `encrypt` rotates the macro ratchet.
    /// Zero rotates on every send.
    pub rotation_interval_secs: u64,
    /// Largest epoch gap a receiver will close in one `decrypt`; also the
    /// number of past epoch keys a sender keeps for its header trail.
    pub max_catch_up_epochs: u64,
    /// Upper bound on cached out-of-order message keys per receiving chain.
    pub max_skipped_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: DEFAULT_ROTATION_INTERVAL.as_secs(),
            max_catch_up_epochs: 16,
            max_skipped_messages: 1000,
        }
    }
}

impl SessionConfig {
    /// Rotation interval as a [`Duration`].
    pub const fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    /// Builder-style override of the rotation interval.
    #[must_use]
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval_secs = interval.as_secs();
        self
    }

    /// Reject limits that would make a session unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_catch_up_epochs == 0 {
            return Err(RatchetError::Config(
                "max_catch_up_epochs must be at least 1".into(),
            ));
        }
        if self.max_skipped_messages == 0 {
            return Err(RatchetError::Config(
                "max_skipped_messages must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Read a JSON config file. Missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RatchetError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            RatchetError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(val) = lookup(ENV_ROTATION_INTERVAL) {
            self.rotation_interval_secs = parse_env(ENV_ROTATION_INTERVAL, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_CATCH_UP) {
            self.max_catch_up_epochs = parse_env(ENV_MAX_CATCH_UP, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_SKIP) {
            self.max_skipped_messages = parse_env(ENV_MAX_SKIP, &val)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RatchetError::Config(format!("{name}={value:?}: {e}")))
}

/// Load configuration with hierarchical resolution and validate it.
pub fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    config.apply_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}
