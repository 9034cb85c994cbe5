//! Core error types and result handling
//!
//! Every fallible operation in the crate returns [`ModbusResult`]. The
//! variants map onto the error kinds the engine distinguishes at runtime:
//! wire-level protocol faults, typed register-map violations, transport and
//! timer failures, and the busy/exception states of the master.

use thiserror::Error;

/// Unified error type for the Modbus RTU engine
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Protocol-level error (malformed frame, echo mismatch, bad byte count)
    #[error("protocol error: {message}")]
    Protocol {
        /// Error description
        message: String,
    },

    /// Function code outside the supported set
    #[error("invalid function code: {code:#04x}")]
    InvalidFunction {
        /// The offending function code
        code: u8,
    },

    /// Data validation error (range violation, width mismatch, bad JSON field)
    #[error("invalid data: {message}")]
    InvalidData {
        /// Error description
        message: String,
    },

    /// Transport collaborator reported a send failure
    #[error("transport error: {message}")]
    Transport {
        /// Error description
        message: String,
    },

    /// Timer collaborator could not arm or cancel a timeout
    #[error("timer error: {message}")]
    Timer {
        /// Error description
        message: String,
    },

    /// A master request is already in flight
    #[error("engine busy: a request is already in flight")]
    Busy,

    /// The remote slave answered with a Modbus exception frame
    #[error("modbus exception for function {function:#04x}: exception code {code}")]
    Exception {
        /// Function code of the original request
        function: u8,
        /// Exception code from the response
        code: u8,
    },

    /// File I/O error during register map load/save
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON syntax error during register map load/save
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModbusError {
    /// Create a protocol error from any displayable message
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an invalid data error from any displayable message
    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a transport error from any displayable message
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a timer error from any displayable message
    pub fn timer(message: impl Into<String>) -> Self {
        Self::Timer {
            message: message.into(),
        }
    }
}

/// Result type used throughout the crate
pub type ModbusResult<T> = Result<T, ModbusError>;
