//! Session configuration
//!
//! Loaded from a JSON document in which every field is optional.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ble::transport::ConnectionParameters;
use crate::echo::session::DEFAULT_MTU;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// Bound on each echoed notification.
    pub wait_timeout_ms: u64,
    /// Bound on the connection parameter update confirmation.
    pub param_update_timeout_ms: u64,
    pub run_duration_ms: u64,
    pub min_payload_size: usize,
    /// Delay between echo iterations.
    pub pacing_ms: u64,
    /// Payload MTU to apply once connected. `None` keeps the default of 20.
    pub mtu: Option<usize>,
    pub connection_parameters: ConnectionParameters,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 10_000,
            param_update_timeout_ms: 10_000,
            run_duration_ms: 10_000,
            min_payload_size: 1,
            pacing_ms: 10,
            mtu: None,
            connection_parameters: ConnectionParameters::default(),
        }
    }
}

impl EchoConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: EchoConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_payload_size == 0 {
            return Err(ConfigError::Invalid("min_payload_size must be at least 1".into()));
        }
        if self.mtu == Some(0) {
            return Err(ConfigError::Invalid("mtu must be at least 1".into()));
        }
        if self.min_payload_size > self.effective_mtu() {
            return Err(ConfigError::Invalid(format!(
                "min_payload_size {} exceeds mtu {}",
                self.min_payload_size,
                self.effective_mtu()
            )));
        }
        let params = &self.connection_parameters;
        if params.interval_min > params.interval_max {
            return Err(ConfigError::Invalid(format!(
                "interval_min {} exceeds interval_max {}",
                params.interval_min, params.interval_max
            )));
        }
        if self.wait_timeout_ms == 0 || self.param_update_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// MTU the session will run with.
    pub fn effective_mtu(&self) -> usize {
        self.mtu.unwrap_or(DEFAULT_MTU)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn param_update_timeout(&self) -> Duration {
        Duration::from_millis(self.param_update_timeout_ms)
    }

    pub fn run_duration(&self) -> Duration {
        Duration::from_millis(self.run_duration_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}
