//! Modbus RTU protocol constants based on the official specification
//!
//! The RTU quantity limits come straight from the specification: a request
//! naming more data than fits the 256-byte ADU is answered with an
//! ILLEGAL DATA VALUE exception rather than truncated.

// ============================================================================
// Frame Geometry
// ============================================================================

/// Fixed request frame length for FC 01-06
/// Format: Address(1) + Function(1) + Field(2) + Field(2) + CRC(2) = 8 bytes
pub const REQUEST_FRAME_LEN: usize = 8;

/// Header length of a variable-length write request (FC 0F/10)
/// Format: Address(1) + Function(1) + Start(2) + Quantity(2) + ByteCount(1)
pub const WRITE_MULTI_HEADER_LEN: usize = 7;

/// Header length of a read response (FC 01-04)
/// Format: Address(1) + Function(1) + ByteCount(1)
pub const READ_RESPONSE_HEADER_LEN: usize = 3;

/// Exception response frame length
/// Format: Address(1) + Function|0x80(1) + ExceptionCode(1) + CRC(2)
pub const EXCEPTION_FRAME_LEN: usize = 5;

/// Trailing CRC length
pub const CRC_LEN: usize = 2;

/// Broadcast slave address: requests are processed but never answered
pub const BROADCAST_ADDRESS: u8 = 0;

// ============================================================================
// Quantity Limits
// ============================================================================

/// Maximum number of coils/inputs for FC01/FC02 (0x07D0)
pub const MAX_READ_BITS: u16 = 0x07D0;

/// Maximum number of registers for FC03/FC04 (0x007D)
pub const MAX_READ_REGISTERS: u16 = 0x007D;

/// Maximum number of coils for FC0F (0x07B0)
pub const MAX_WRITE_COILS: u16 = 0x07B0;

/// Maximum number of registers for FC10 (0x007B)
pub const MAX_WRITE_REGISTERS: u16 = 0x007B;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Coils (FC15)
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// High bit marking an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Engine Defaults
// ============================================================================

/// Default master response timeout in milliseconds
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 2000;

/// Default master retry budget after the initial transmission
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Default accumulation buffer capacity in bytes
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_geometry() {
        assert_eq!(REQUEST_FRAME_LEN, 8);
        assert_eq!(WRITE_MULTI_HEADER_LEN, 7);
        assert_eq!(EXCEPTION_FRAME_LEN, 5);
        // A maximal FC10 request still fits the accumulation buffer
        let max_write = WRITE_MULTI_HEADER_LEN + (MAX_WRITE_REGISTERS as usize) * 2 + CRC_LEN;
        assert!(max_write <= DEFAULT_INPUT_BUFFER_SIZE);
    }

    #[test]
    fn test_quantity_limits() {
        assert_eq!(MAX_READ_BITS, 2000);
        assert_eq!(MAX_READ_REGISTERS, 125);
        assert_eq!(MAX_WRITE_COILS, 1968);
        assert_eq!(MAX_WRITE_REGISTERS, 123);
    }
}
