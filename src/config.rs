//! # Runtime Configuration
//!
//! Deserializable settings read once at startup by the executable wrapper.
//! The engines never parse configuration themselves; they receive the
//! already-validated values through their constructors.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_ATTEMPTS, DEFAULT_INPUT_BUFFER_SIZE, DEFAULT_RESPONSE_TIMEOUT_MS, REQUEST_FRAME_LEN,
};
use crate::error::{ModbusError, ModbusResult};

/// Lowest baud rate the serial transport accepts
pub const MIN_BAUD_RATE: u32 = 600;

/// Highest baud rate the serial transport accepts
pub const MAX_BAUD_RATE: u32 = 256_000;

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_buffer_size() -> usize {
    DEFAULT_INPUT_BUFFER_SIZE
}

/// Engine settings loaded from a JSON configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Serial port name, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    /// Line speed in baud (600-256000)
    pub baud_rate: u32,
    /// Slave device address
    pub device_address: u8,
    /// Master response timeout in milliseconds
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Master retry budget after the initial transmission
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Accumulation buffer capacity in bytes
    #[serde(default = "default_buffer_size")]
    pub max_input_buffer_size: usize,
}

impl EngineConfig {
    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every field against its documented range
    pub fn validate(&self) -> ModbusResult<()> {
        if self.port.is_empty() {
            return Err(ModbusError::invalid_data("serial port name is empty"));
        }
        if !(MIN_BAUD_RATE..=MAX_BAUD_RATE).contains(&self.baud_rate) {
            return Err(ModbusError::invalid_data(format!(
                "baud rate {} outside {MIN_BAUD_RATE}..={MAX_BAUD_RATE}",
                self.baud_rate
            )));
        }
        if self.response_timeout_ms == 0 {
            return Err(ModbusError::invalid_data("response timeout is zero"));
        }
        if self.max_input_buffer_size < REQUEST_FRAME_LEN {
            return Err(ModbusError::invalid_data(format!(
                "input buffer of {} bytes cannot hold one frame",
                self.max_input_buffer_size
            )));
        }
        Ok(())
    }

    /// Response timeout as a [`Duration`]
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}
