//! Layered TOML configuration for conntrack.
//!
//! Loads from:
//! - Global config: `~/.config/conntrack/conntrack.toml`
//! - Project config: `<workspace>/.conntrack/conntrack.toml`
//!
//! Project values take precedence when set.
//!
//! # Example
//!
//! ```no_run
//! use conntrack_settings::ConfigLoader;
//!
//! let config = ConfigLoader::load(std::path::Path::new(".")).unwrap();
//! println!("{:?}", config.tracker.idle_timeout());
//! ```

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Idle timeout used when none is configured.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

/// Upstream connect timeout used when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Grace period for open connections on shutdown.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// How often relays check whether both legs went idle.
pub const DEFAULT_IDLE_CHECK_INTERVAL_MS: u64 = 1000;

/// Errors from settings operations.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// TOML deserialization failed.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// TOML serialization failed.
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// I/O error reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A value parsed but is out of range.
    #[error("Invalid config value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: &'static str },
}

/// TOML `[tracker]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerSettings {
    /// Seconds without traffic after which a connection counts as idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Log an event when a connection goes idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_idle: Option<bool>,
}

impl TrackerSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS))
    }

    pub fn report_idle(&self) -> bool {
        self.report_idle.unwrap_or(true)
    }
}

/// TOML `[relay]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySettings {
    /// Address to accept clients on, e.g. `"127.0.0.1:9400"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    /// Address every client is relayed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,

    /// Label recorded as the upstream leg's remote host.
    /// Defaults to the upstream address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_check_interval_ms: Option<u64>,
}

impl RelaySettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        )
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs.unwrap_or(DEFAULT_DRAIN_TIMEOUT_SECS))
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(
            self.idle_check_interval_ms
                .unwrap_or(DEFAULT_IDLE_CHECK_INTERVAL_MS),
        )
    }
}

/// Top-level configuration, corresponding to `conntrack.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConntrackConfig {
    #[serde(default)]
    pub tracker: TrackerSettings,

    #[serde(default)]
    pub relay: RelaySettings,
}

impl ConntrackConfig {
    /// Parse a `ConntrackConfig` from a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::ParseError` if the TOML is malformed or
    /// contains unrecognised keys for this schema, and
    /// `SettingsError::InvalidValue` if a value is out of range.
    pub fn parse(toml: &str) -> Result<Self, SettingsError> {
        let config: Self = toml::from_str(toml).map_err(SettingsError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot be used.
    ///
    /// # Errors
    /// Returns `SettingsError::InvalidValue` naming the first offending key.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.relay.idle_check_interval_ms == Some(0) {
            return Err(SettingsError::InvalidValue {
                key: "relay.idle_check_interval_ms",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    /// Load a `ConntrackConfig` from a file on disk.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on read failure, or
    /// `SettingsError::ParseError` if the content is not valid.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Serialize this config to a TOML string.
    ///
    /// # Errors
    /// Returns `SettingsError::SerializeError` if serialization fails.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(SettingsError::SerializeError)
    }

    /// Save this config to a file, creating parent directories as needed.
    ///
    /// # Errors
    /// Returns `SettingsError::Io` on write failure, or
    /// `SettingsError::SerializeError` if serialization fails.
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Merge `other` (project-level) on top of `self` (global-level).
    /// Every field is a scalar; `other` wins when it is set.
    #[must_use]
    pub fn merge(mut self, other: ConntrackConfig) -> ConntrackConfig {
        fn pick<T>(base: &mut Option<T>, over: Option<T>) {
            if over.is_some() {
                *base = over;
            }
        }

        pick(&mut self.tracker.idle_timeout_secs, other.tracker.idle_timeout_secs);
        pick(&mut self.tracker.report_idle, other.tracker.report_idle);

        pick(&mut self.relay.listen, other.relay.listen);
        pick(&mut self.relay.upstream, other.relay.upstream);
        pick(&mut self.relay.upstream_label, other.relay.upstream_label);
        pick(&mut self.relay.connect_timeout_secs, other.relay.connect_timeout_secs);
        pick(&mut self.relay.drain_timeout_secs, other.relay.drain_timeout_secs);
        pick(&mut self.relay.idle_check_interval_ms, other.relay.idle_check_interval_ms);
        self
    }

    /// A starter config with every default written out.
    pub fn starter() -> Self {
        Self {
            tracker: TrackerSettings {
                idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
                report_idle: Some(true),
            },
            relay: RelaySettings {
                listen: Some("127.0.0.1:9400".to_string()),
                upstream: None,
                upstream_label: None,
                connect_timeout_secs: Some(DEFAULT_CONNECT_TIMEOUT_SECS),
                drain_timeout_secs: Some(DEFAULT_DRAIN_TIMEOUT_SECS),
                idle_check_interval_ms: Some(DEFAULT_IDLE_CHECK_INTERVAL_MS),
            },
        }
    }
}
