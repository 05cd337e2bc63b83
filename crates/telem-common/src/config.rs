//! Configuration structures for a telemetry node.
//!
//! Supports TOML deserialization with defaults matching the values the
//! bus firmware ships with. Role and telemetry enablement are read at
//! startup and branched on at runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Human-readable node name (for logging).
    pub node_name: String,

    /// Time-sync role of this node.
    pub role: Role,

    /// When false every telemetry entry point is a successful no-op.
    pub telemetry_enabled: bool,

    /// Hardware timer configuration.
    pub clock: ClockConfig,

    /// Time-sync policy configuration.
    pub timesync: TimeSyncConfig,

    /// Dispatch and loop configuration.
    pub dispatch: DispatchConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: String::from("node"),
            role: Role::Client,
            telemetry_enabled: true,
            clock: ClockConfig::default(),
            timesync: TimeSyncConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

/// Fixed time-sync role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns ground-truth time; answers requests and announces unix time.
    Master,
    /// Estimates its offset from the master.
    #[default]
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Hardware timer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Rate of the free-running 32-bit tick counter.
    pub ticks_per_second: u32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: 1000,
        }
    }
}

/// Time-sync policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    /// Candidate offsets larger than this (in magnitude) are discarded.
    pub max_step_ms: u64,

    /// Divisor applied to each accepted candidate offset.
    pub smooth_div: u32,

    /// Period of client `request_sync` triggers.
    #[serde(with = "humantime_serde")]
    pub request_interval: Duration,

    /// Period of master `announce` triggers.
    #[serde(with = "humantime_serde")]
    pub announce_interval: Duration,

    /// Priority carried in master announcements.
    pub announce_priority: u64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            max_step_ms: 30_000,
            smooth_div: 4,
            request_interval: Duration::from_secs(1),
            announce_interval: Duration::from_secs(1),
            announce_priority: 0,
        }
    }
}

/// Dispatch facade and telemetry loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Time budget handed to `drain_all` on every loop cycle.
    #[serde(with = "humantime_serde")]
    pub drain_budget: Duration,

    /// Maximum length of a formatted error record in bytes.
    pub error_message_cap: usize,

    /// Scheduler slice yielded between loop cycles.
    #[serde(with = "humantime_serde")]
    pub yield_slice: Duration,

    /// Bound on each in-memory router queue.
    pub queue_capacity: usize,

    /// Name of the byte-stream side attached to the router.
    pub bus_side_name: String,

    /// Identifier of the byte-stream side attached to the router.
    pub bus_side_id: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            drain_budget: Duration::from_millis(5),
            error_message_cap: 512,
            yield_slice: Duration::from_millis(1),
            queue_capacity: 256,
            bus_side_name: String::from("can"),
            bus_side_id: 3,
        }
    }
}

impl DispatchConfig {
    /// Drain budget in whole milliseconds, saturating at `u32::MAX`.
    #[must_use]
    pub fn drain_budget_ms(&self) -> u32 {
        u32::try_from(self.drain_budget.as_millis()).unwrap_or(u32::MAX)
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clock.ticks_per_second == 0 {
            return Err(ConfigError::Invalid {
                field: "clock.ticks_per_second",
                reason: "must be at least 1".into(),
            });
        }
        if self.timesync.smooth_div == 0 {
            return Err(ConfigError::Invalid {
                field: "timesync.smooth_div",
                reason: "must be at least 1".into(),
            });
        }
        if self.dispatch.error_message_cap == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.error_message_cap",
                reason: "must be at least 1".into(),
            });
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.queue_capacity",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is outside its permitted range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
