//! Session timing and heuristic configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::anomaly::AnomalyHeuristics;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Timing knobs of a session, in seconds so config files stay readable.
///
/// Every field has a default, so a config file only needs to name the
/// values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound for a single connect attempt.
    pub connect_timeout_secs: f64,
    /// Upper bound for a single write, subscribe or disconnect.
    pub write_timeout_secs: f64,
    /// Minimum spacing between keep-alive writes.
    pub keep_alive_interval_secs: f64,
    /// Pause after a failed reconnect in aggressive mode.
    pub reconnect_backoff_secs: f64,
    /// Pacing of the monitoring loop; also bounds stop latency.
    pub poll_interval_secs: f64,
    /// Wait between a fuzz payload write and the liveness check.
    pub settle_delay_secs: f64,
    /// Wait between an acknowledged playback command and the liveness check.
    pub command_settle_secs: f64,
    /// Wait before reconnecting after a crash signal.
    pub crash_cooldown_secs: f64,
    /// Spacing of console status lines while holding the link.
    pub status_interval_secs: f64,
    pub anomaly: AnomalyHeuristics,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15.0,
            write_timeout_secs: 5.0,
            keep_alive_interval_secs: 30.0,
            reconnect_backoff_secs: 5.0,
            poll_interval_secs: 1.0,
            settle_delay_secs: 2.0,
            command_settle_secs: 0.5,
            crash_cooldown_secs: 5.0,
            status_interval_secs: 10.0,
            anomaly: AnomalyHeuristics::default(),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl SessionConfig {
    /// Load a JSON config file and validate it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: SessionConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject negative, non-finite or nonsensical timings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields: [(&'static str, f64); 9] = [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("write_timeout_secs", self.write_timeout_secs),
            ("keep_alive_interval_secs", self.keep_alive_interval_secs),
            ("reconnect_backoff_secs", self.reconnect_backoff_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("settle_delay_secs", self.settle_delay_secs),
            ("command_settle_secs", self.command_settle_secs),
            ("crash_cooldown_secs", self.crash_cooldown_secs),
            ("status_interval_secs", self.status_interval_secs),
        ];
        for (field, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("{} is not a non-negative number of seconds", value),
                });
            }
            if let Err(e) = Duration::try_from_secs_f64(value) {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("{} seconds is out of range: {}", value, e),
                });
            }
        }
        if self.poll_interval_secs <= 0.0 || self.poll_interval_secs > 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_secs",
                reason: "must be in (0, 1] so stop requests are honored within a second"
                    .to_string(),
            });
        }
        if self.connect_timeout_secs == 0.0 || self.write_timeout_secs == 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "timeouts",
                reason: "connect and write timeouts must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        secs(self.write_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        secs(self.keep_alive_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        secs(self.reconnect_backoff_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        secs(self.settle_delay_secs)
    }

    pub fn command_settle(&self) -> Duration {
        secs(self.command_settle_secs)
    }

    pub fn crash_cooldown(&self) -> Duration {
        secs(self.crash_cooldown_secs)
    }

    pub fn status_interval(&self) -> Duration {
        secs(self.status_interval_secs)
    }
}
