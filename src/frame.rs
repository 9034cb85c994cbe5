//! # RTU Frame Codec
//!
//! Encoding and decoding of Modbus RTU frames for the supported function
//! codes. Every frame starts with a one-byte slave address and function code
//! and ends with a two-byte CRC; multi-byte fields are big-endian on the
//! wire except the trailing CRC, which is little-endian.
//!
//! Decoding works through bounds-checked byte readers only; nothing here
//! relies on the layout of in-memory structs.

use crate::constants::*;
use crate::crc::{crc16, frame_crc_ok};
use crate::error::{ModbusError, ModbusResult};

/// A master-to-slave request PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// FC 01-04: read coils / discrete inputs / holding / input registers
    Read {
        /// Function code (0x01-0x04)
        function: u8,
        /// Starting address
        start: u16,
        /// Number of bits or registers
        quantity: u16,
    },
    /// FC 05/06: write single coil / register
    WriteSingle {
        /// Function code (0x05 or 0x06)
        function: u8,
        /// Coil or register address
        address: u16,
        /// Output value; FC05 allows only 0x0000 and 0xFF00
        value: u16,
    },
    /// FC 0F/10: write multiple coils / registers
    WriteMultiple {
        /// Function code (0x0F or 0x10)
        function: u8,
        /// Starting address
        start: u16,
        /// Number of bits or registers
        quantity: u16,
        /// Packed coil bits (FC0F) or big-endian register data (FC10)
        payload: Vec<u8>,
    },
}

impl Request {
    /// Function code of the request
    pub fn function(&self) -> u8 {
        match self {
            Request::Read { function, .. }
            | Request::WriteSingle { function, .. }
            | Request::WriteMultiple { function, .. } => *function,
        }
    }
}

/// A slave-to-master response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// FC 01/02: packed coil or discrete-input bits
    ReadBits {
        /// Function code (0x01 or 0x02)
        function: u8,
        /// LSB-first packed bits
        data: Vec<u8>,
    },
    /// FC 03/04: register bytes in map order
    ReadRegisters {
        /// Function code (0x03 or 0x04)
        function: u8,
        /// Register data
        data: Vec<u8>,
    },
    /// FC 05/06: echo of the request body
    WriteSingleEcho {
        /// Function code (0x05 or 0x06)
        function: u8,
        /// Echoed address
        address: u16,
        /// Echoed value
        value: u16,
    },
    /// FC 0F/10: echo of the first four request fields
    WriteMultipleEcho {
        /// Function code (0x0F or 0x10)
        function: u8,
        /// Echoed starting address
        start: u16,
        /// Echoed quantity
        quantity: u16,
    },
    /// Exception frame; `function` carries the low seven bits
    Exception {
        /// Function code of the failed request (high bit stripped)
        function: u8,
        /// Modbus exception code
        code: u8,
    },
}

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Function code not supported
    IllegalFunction = 0x01,
    /// Address not present in the register map
    IllegalDataAddress = 0x02,
    /// Quantity or value outside the permitted range
    IllegalDataValue = 0x03,
    /// Unrecoverable device error
    ServerDeviceFailure = 0x04,
    /// Long-running request accepted
    Acknowledge = 0x05,
    /// Device busy with a long-running request
    ServerDeviceBusy = 0x06,
    /// Extended file area parity failure
    MemoryParityError = 0x08,
    /// Gateway misconfigured or overloaded
    GatewayPathUnavailable = 0x0A,
    /// Gateway target did not respond
    GatewayTargetRespondFailed = 0x0B,
}

impl ExceptionCode {
    /// Wire value of the exception code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a wire value
    pub fn from_code(code: u8) -> Option<ExceptionCode> {
        match code {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::ServerDeviceFailure),
            0x05 => Some(ExceptionCode::Acknowledge),
            0x06 => Some(ExceptionCode::ServerDeviceBusy),
            0x08 => Some(ExceptionCode::MemoryParityError),
            0x0A => Some(ExceptionCode::GatewayPathUnavailable),
            0x0B => Some(ExceptionCode::GatewayTargetRespondFailed),
            _ => None,
        }
    }

    /// Human-readable exception name
    pub fn name(self) -> &'static str {
        match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::ServerDeviceFailure => "Server Device Failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::ServerDeviceBusy => "Server Device Busy",
            ExceptionCode::MemoryParityError => "Memory Parity Error",
            ExceptionCode::GatewayPathUnavailable => "Gateway Path Unavailable",
            ExceptionCode::GatewayTargetRespondFailed => "Gateway Target Failed to Respond",
        }
    }
}

/// Human-readable name for a raw exception code byte
pub fn exception_name(code: u8) -> &'static str {
    ExceptionCode::from_code(code)
        .map(ExceptionCode::name)
        .unwrap_or("Unknown Exception")
}

// ============================================================================
// Bit packing
// ============================================================================

/// Pack coil states LSB-first into `ceil(len/8)` bytes
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            packed[i / 8] |= 1 << (i % 8);
        }
    }
    packed
}

/// Unpack `count` coil states from LSB-first packed bytes
pub fn unpack_bits(data: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| data.get(i / 8).is_some_and(|byte| byte >> (i % 8) & 1 != 0))
        .collect()
}

// ============================================================================
// Encoding
// ============================================================================

fn push_u16_be(frame: &mut Vec<u8>, value: u16) {
    frame.extend_from_slice(&value.to_be_bytes());
}

fn finalize(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Encode a request frame, appending the little-endian CRC
pub fn encode_request(device_address: u8, request: &Request) -> ModbusResult<Vec<u8>> {
    let mut frame = Vec::with_capacity(REQUEST_FRAME_LEN);
    frame.push(device_address);
    match request {
        Request::Read {
            function,
            start,
            quantity,
        } => {
            if !(FC_READ_COILS..=FC_READ_INPUT_REGISTERS).contains(function) {
                return Err(ModbusError::InvalidFunction { code: *function });
            }
            frame.push(*function);
            push_u16_be(&mut frame, *start);
            push_u16_be(&mut frame, *quantity);
        }
        Request::WriteSingle {
            function,
            address,
            value,
        } => {
            if *function != FC_WRITE_SINGLE_COIL && *function != FC_WRITE_SINGLE_REGISTER {
                return Err(ModbusError::InvalidFunction { code: *function });
            }
            if *function == FC_WRITE_SINGLE_COIL && *value != 0x0000 && *value != 0xFF00 {
                return Err(ModbusError::invalid_data(format!(
                    "coil value {value:#06x} is neither 0x0000 nor 0xFF00"
                )));
            }
            frame.push(*function);
            push_u16_be(&mut frame, *address);
            push_u16_be(&mut frame, *value);
        }
        Request::WriteMultiple {
            function,
            start,
            quantity,
            payload,
        } => {
            if *function != FC_WRITE_MULTIPLE_COILS && *function != FC_WRITE_MULTIPLE_REGISTERS {
                return Err(ModbusError::InvalidFunction { code: *function });
            }
            let expected = if *function == FC_WRITE_MULTIPLE_COILS {
                (*quantity as usize).div_ceil(8)
            } else {
                *quantity as usize * 2
            };
            if payload.len() != expected {
                return Err(ModbusError::invalid_data(format!(
                    "payload of {} bytes does not cover quantity {quantity}",
                    payload.len()
                )));
            }
            frame.push(*function);
            push_u16_be(&mut frame, *start);
            push_u16_be(&mut frame, *quantity);
            frame.push(payload.len() as u8);
            frame.extend_from_slice(payload);
        }
    }
    Ok(finalize(frame))
}

/// Encode a response frame, appending the little-endian CRC
pub fn encode_response(device_address: u8, response: &Response) -> Vec<u8> {
    let mut frame = Vec::with_capacity(REQUEST_FRAME_LEN);
    frame.push(device_address);
    match response {
        Response::ReadBits { function, data } | Response::ReadRegisters { function, data } => {
            frame.push(*function);
            frame.push(data.len() as u8);
            frame.extend_from_slice(data);
        }
        Response::WriteSingleEcho {
            function,
            address,
            value,
        } => {
            frame.push(*function);
            push_u16_be(&mut frame, *address);
            push_u16_be(&mut frame, *value);
        }
        Response::WriteMultipleEcho {
            function,
            start,
            quantity,
        } => {
            frame.push(*function);
            push_u16_be(&mut frame, *start);
            push_u16_be(&mut frame, *quantity);
        }
        Response::Exception { function, code } => {
            frame.push(function | EXCEPTION_FLAG);
            frame.push(*code);
        }
    }
    finalize(frame)
}

// ============================================================================
// Decoding
// ============================================================================

fn read_u16_be(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

/// Decode a complete request frame (CRC included) into its typed form
pub fn decode_request(frame: &[u8]) -> ModbusResult<(u8, Request)> {
    if frame.len() < REQUEST_FRAME_LEN {
        return Err(ModbusError::protocol(format!(
            "request frame of {} bytes truncated",
            frame.len()
        )));
    }
    if !frame_crc_ok(frame) {
        return Err(ModbusError::protocol("request CRC mismatch"));
    }

    let address = frame[0];
    let function = frame[1];
    let request = match function {
        FC_READ_COILS..=FC_READ_INPUT_REGISTERS => {
            if frame.len() != REQUEST_FRAME_LEN {
                return Err(ModbusError::protocol("read request length mismatch"));
            }
            Request::Read {
                function,
                start: read_u16_be(frame, 2),
                quantity: read_u16_be(frame, 4),
            }
        }
        FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER => {
            if frame.len() != REQUEST_FRAME_LEN {
                return Err(ModbusError::protocol("write request length mismatch"));
            }
            Request::WriteSingle {
                function,
                address: read_u16_be(frame, 2),
                value: read_u16_be(frame, 4),
            }
        }
        FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
            let byte_count = frame[6] as usize;
            if frame.len() != WRITE_MULTI_HEADER_LEN + byte_count + CRC_LEN {
                return Err(ModbusError::protocol("multi-write request length mismatch"));
            }
            Request::WriteMultiple {
                function,
                start: read_u16_be(frame, 2),
                quantity: read_u16_be(frame, 4),
                payload: frame[WRITE_MULTI_HEADER_LEN..WRITE_MULTI_HEADER_LEN + byte_count]
                    .to_vec(),
            }
        }
        _ => return Err(ModbusError::InvalidFunction { code: function }),
    };
    Ok((address, request))
}

/// Decode a complete response frame (CRC included) into its typed form
pub fn decode_response(frame: &[u8]) -> ModbusResult<(u8, Response)> {
    if frame.len() < EXCEPTION_FRAME_LEN {
        return Err(ModbusError::protocol(format!(
            "response frame of {} bytes truncated",
            frame.len()
        )));
    }
    if !frame_crc_ok(frame) {
        return Err(ModbusError::protocol("response CRC mismatch"));
    }

    let address = frame[0];
    let function = frame[1];
    let response = if function & EXCEPTION_FLAG != 0 {
        if frame.len() != EXCEPTION_FRAME_LEN {
            return Err(ModbusError::protocol("exception frame length mismatch"));
        }
        Response::Exception {
            function: function & !EXCEPTION_FLAG,
            code: frame[2],
        }
    } else {
        match function {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
            | FC_READ_INPUT_REGISTERS => {
                let byte_count = frame[2] as usize;
                if frame.len() != READ_RESPONSE_HEADER_LEN + byte_count + CRC_LEN {
                    return Err(ModbusError::protocol("read response length mismatch"));
                }
                let data = frame
                    [READ_RESPONSE_HEADER_LEN..READ_RESPONSE_HEADER_LEN + byte_count]
                    .to_vec();
                if function <= FC_READ_DISCRETE_INPUTS {
                    Response::ReadBits { function, data }
                } else {
                    Response::ReadRegisters { function, data }
                }
            }
            FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER => {
                if frame.len() != REQUEST_FRAME_LEN {
                    return Err(ModbusError::protocol("write echo length mismatch"));
                }
                Response::WriteSingleEcho {
                    function,
                    address: read_u16_be(frame, 2),
                    value: read_u16_be(frame, 4),
                }
            }
            FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
                if frame.len() != REQUEST_FRAME_LEN {
                    return Err(ModbusError::protocol("multi-write echo length mismatch"));
                }
                Response::WriteMultipleEcho {
                    function,
                    start: read_u16_be(frame, 2),
                    quantity: read_u16_be(frame, 4),
                }
            }
            _ => return Err(ModbusError::InvalidFunction { code: function }),
        }
    };
    Ok((address, response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_read_request_bytes() {
        let frame = encode_request(
            0x01,
            &Request::Read {
                function: 0x03,
                start: 0x0010,
                quantity: 1,
            },
        )
        .unwrap();
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x10, 0x00, 0x01, 0x85, 0xCF]);
    }

    #[test]
    fn test_known_write_coil_bytes() {
        let frame = encode_request(
            0x01,
            &Request::WriteSingle {
                function: 0x05,
                address: 0x0005,
                value: 0xFF00,
            },
        )
        .unwrap();
        assert_eq!(frame, [0x01, 0x05, 0x00, 0x05, 0xFF, 0x00, 0x9C, 0x3B]);
    }

    #[test]
    fn test_request_round_trip_all_shapes() {
        let requests = [
            Request::Read { function: 0x01, start: 0x0000, quantity: 16 },
            Request::Read { function: 0x02, start: 0x0013, quantity: 5 },
            Request::Read { function: 0x03, start: 0x006B, quantity: 3 },
            Request::Read { function: 0x04, start: 0x0008, quantity: 1 },
            Request::WriteSingle { function: 0x05, address: 0x00AC, value: 0xFF00 },
            Request::WriteSingle { function: 0x06, address: 0x0001, value: 0x0003 },
            Request::WriteMultiple {
                function: 0x0F,
                start: 0x0013,
                quantity: 10,
                payload: vec![0xCD, 0x01],
            },
            Request::WriteMultiple {
                function: 0x10,
                start: 0x0001,
                quantity: 2,
                payload: vec![0x00, 0x0A, 0x01, 0x02],
            },
        ];
        for request in requests {
            let frame = encode_request(0x11, &request).unwrap();
            let (address, decoded) = decode_request(&frame).unwrap();
            assert_eq!(address, 0x11);
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_response_round_trip() {
        let responses = [
            Response::ReadBits { function: 0x01, data: vec![0xCD, 0x6B, 0x05] },
            Response::ReadRegisters { function: 0x03, data: vec![0x02, 0x2B, 0x00, 0x00] },
            Response::WriteSingleEcho { function: 0x06, address: 0x0001, value: 0x0003 },
            Response::WriteMultipleEcho { function: 0x10, start: 0x0001, quantity: 2 },
            Response::Exception { function: 0x03, code: 0x02 },
        ];
        for response in responses {
            let frame = encode_response(0x01, &response);
            let (address, decoded) = decode_response(&frame).unwrap();
            assert_eq!(address, 0x01);
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn test_exception_frame_layout() {
        let frame = encode_response(
            0x01,
            &Response::Exception {
                function: 0x07,
                code: ExceptionCode::IllegalFunction.code(),
            },
        );
        assert_eq!(frame.len(), EXCEPTION_FRAME_LEN);
        assert_eq!(frame[1], 0x87);
        assert_eq!(frame[2], 0x01);
    }

    #[test]
    fn test_illegal_coil_value_rejected() {
        let result = encode_request(
            0x01,
            &Request::WriteSingle {
                function: 0x05,
                address: 0,
                value: 0x1234,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut frame = encode_request(
            0x01,
            &Request::Read { function: 0x03, start: 0, quantity: 1 },
        )
        .unwrap();
        frame[6] ^= 0xFF;
        assert!(decode_request(&frame).is_err());
    }

    #[test]
    fn test_unknown_function_decode() {
        let mut frame = vec![0x01, 0x07, 0x00, 0x00, 0x00, 0x00];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        let err = decode_request(&frame).unwrap_err();
        assert!(matches!(err, ModbusError::InvalidFunction { code: 0x07 }));
    }

    #[test]
    fn test_bit_packing() {
        let bits = [true, false, true, true, false, false, true, true, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0b1100_1101, 0b0000_0001]);
        assert_eq!(unpack_bits(&packed, bits.len()), bits);
    }

    #[test]
    fn test_exception_names() {
        assert_eq!(exception_name(0x01), "Illegal Function");
        assert_eq!(exception_name(0x02), "Illegal Data Address");
        assert_eq!(exception_name(0x0B), "Gateway Target Failed to Respond");
        assert_eq!(exception_name(0x55), "Unknown Exception");
    }
}
