//! Bus configuration
//!
//! Priority (highest to lowest):
//! 1. Environment variables prefixed with `ELTAKOBUS_` (`__` separates nesting)
//! 2. YAML config file
//! 3. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "ELTAKOBUS_";

/// How the transport decides whether the line echoes our own telegrams
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EchoMode {
    /// Probe the line once at startup
    #[default]
    Auto,
    Enabled,
    Disabled,
}

/// Serial line and exchange timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub port: String,
    /// Baud rate; the bus runs at 57600 8N1
    pub baud_rate: u32,
    pub echo: EchoMode,
    /// How long an exchange waits for its reply
    pub exchange_timeout_ms: u64,
    /// Age after which a sent telegram is no longer expected as echo
    pub echo_grace_ms: u64,
    /// How long one echo probe waits for the probe to come back
    pub calibration_timeout_ms: u64,
    /// Probes sent before giving up on ambiguous answers
    pub calibration_attempts: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 57600,
            echo: EchoMode::Auto,
            exchange_timeout_ms: 1000,
            echo_grace_ms: 3000,
            calibration_timeout_ms: 200,
            calibration_attempts: 3,
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<()> {
        if self.port.is_empty() {
            return Err(BusError::config("Port path cannot be empty"));
        }
        if self.baud_rate == 0 {
            return Err(BusError::config("Baud rate must be greater than zero"));
        }
        if self.exchange_timeout_ms == 0 {
            return Err(BusError::config(
                "Exchange timeout must be greater than zero",
            ));
        }
        if self.echo == EchoMode::Auto && self.calibration_attempts == 0 {
            return Err(BusError::config(
                "Echo calibration needs at least one attempt",
            ));
        }
        Ok(())
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }

    pub fn echo_grace(&self) -> Duration {
        Duration::from_millis(self.echo_grace_ms)
    }

    pub fn calibration_timeout(&self) -> Duration {
        Duration::from_millis(self.calibration_timeout_ms)
    }
}

/// Retry budget of the locking protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Outer lock attempts that made no scan progress
    pub attempts: u32,
    /// Pause after a lock request went unanswered
    pub backoff_ms: u64,
    pub unlock_attempts: u32,
    pub unlock_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            attempts: 20,
            backoff_ms: 200,
            unlock_attempts: 20,
            unlock_backoff_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 || self.unlock_attempts == 0 {
            return Err(BusError::config("Lock attempts must be greater than zero"));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn unlock_backoff(&self) -> Duration {
        Duration::from_millis(self.unlock_backoff_ms)
    }
}

/// Complete configuration of one bus connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub serial: SerialConfig,
    pub lock: LockConfig,
    /// Persist the response cache to this file
    pub cache_file: Option<PathBuf>,
}

impl BusConfig {
    /// Layer defaults, the optional YAML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(BusConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(BusError::config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: BusConfig = figment
            .extract()
            .map_err(|e| BusError::config(format!("Failed to load configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.serial.validate()?;
        self.lock.validate()
    }
}
