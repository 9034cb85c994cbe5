//! # RTU Modbus - Register-Map Driven Modbus RTU Engine
//!
//! A Modbus RTU protocol engine in pure Rust: a master and a slave exchange
//! framed, CRC-protected messages over any byte-oriented transport in order
//! to read and write a typed register map with JSON persistence.
//!
//! ## Features
//!
//! - **Typed register map**: heterogeneous elements (bits, integers,
//!   floats, scaled fixed-point, short strings, file records) with
//!   per-element range enforcement and a stable JSON file format
//! - **Stream resynchronisation**: candidate-scan frame recovery on
//!   transports with no inter-character timing, garbage prefixes dropped
//! - **Master state machine**: single outstanding request, response
//!   timeout, retransmission with a configurable retry budget
//! - **Slave dispatch**: full request validation with Modbus exception
//!   responses and broadcast handling
//! - **Injected collaborators**: byte transport and timeout timer are
//!   traits; in-memory and Tokio-backed implementations ship in-crate
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Master | Slave |
//! |------|----------|--------|-------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use rtu_modbus::{
//!     DataType, MemoryTransport, ModbusSlave, RegisterMap, RegisterValue,
//! };
//!
//! let mut map = RegisterMap::new();
//! map.add_element(
//!     0x03, 0x0010, DataType::UInt16, 2, "Line voltage", 0,
//!     RegisterValue::U16(230), RegisterValue::U16(0),
//!     RegisterValue::U16(400), Some("V"),
//! ).unwrap();
//!
//! let transport = Arc::new(MemoryTransport::new());
//! let slave = ModbusSlave::new(0x01, map, transport.clone());
//!
//! // bytes from the wire, garbage tolerated
//! slave.on_bytes(&[0x01, 0x03, 0x00, 0x10, 0x00, 0x01, 0x85, 0xCF]);
//! assert_eq!(transport.sent_count(), 1);
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus RTU protocol constants
pub mod constants;

/// MODBUS CRC-16 computation
pub mod crc;

/// Register data-type tags and value storage
pub mod value;

/// Typed register map with JSON persistence
pub mod regmap;

/// RTU frame encoding and decoding
pub mod frame;

/// Stream resynchronisation buffer and candidate scanners
pub mod resync;

/// Byte transport contract and in-memory implementation
pub mod transport;

/// Timeout timer contract and implementations
pub mod timer;

/// Slave engine: request dispatch against the register map
pub mod slave;

/// Master engine: request/response state machine with retry
pub mod master;

/// Runtime configuration for the executable wrapper
pub mod config;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use rtu_modbus::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{ModbusError, ModbusResult};

// === Register map ===
pub use regmap::{RegisterElement, RegisterMap};
pub use value::{DataType, RegisterValue};

// === Framing ===
pub use crc::{crc16, frame_crc_ok};
pub use frame::{
    decode_request, decode_response, encode_request, encode_response, exception_name, pack_bits,
    unpack_bits, ExceptionCode, Request, Response,
};
pub use resync::{FrameSpan, ResyncBuffer};

// === Engines ===
pub use master::{MasterState, ModbusMaster};
pub use slave::ModbusSlave;

// === Collaborators ===
pub use timer::{ManualTimer, TimeoutTimer, TimerCallback, TimerHandle, TokioTimer};
pub use transport::{MemoryTransport, ModbusTransport};

// === Configuration ===
pub use config::EngineConfig;

// === Protocol limits (commonly needed constants) ===
pub use constants::{
    DEFAULT_ATTEMPTS, DEFAULT_INPUT_BUFFER_SIZE, DEFAULT_RESPONSE_TIMEOUT_MS, MAX_READ_BITS,
    MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("RTU Modbus v{VERSION} - register-map driven Modbus RTU engine")
}
