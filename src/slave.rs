//! # Slave Engine
//!
//! Parses inbound requests against the register map and answers with data,
//! echo or exception frames. The engine is stateless across messages apart
//! from its device address; it owns the register map and the accumulation
//! buffer and holds the transport behind an `Arc`.
//!
//! Protocol violations discovered during a handler are carried as
//! [`ExceptionCode`] values through the result type; the dispatcher turns
//! them into exception frames. Structural wire errors never get this far:
//! the resynchroniser silently skips any byte window that fails CRC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::constants::*;
use crate::error::ModbusError;
use crate::frame::{
    decode_request, encode_response, pack_bits, unpack_bits, ExceptionCode, Request, Response,
};
use crate::regmap::RegisterMap;
use crate::resync::{scan_request, ResyncBuffer};
use crate::transport::ModbusTransport;

struct SlaveInner {
    map: RegisterMap,
    rx: ResyncBuffer,
}

/// Modbus RTU slave engine
pub struct ModbusSlave {
    device_address: u8,
    transport: Arc<dyn ModbusTransport>,
    last_transmit_ok: AtomicBool,
    inner: Mutex<SlaveInner>,
}

impl ModbusSlave {
    /// Create a slave with the default accumulation buffer capacity
    pub fn new(
        device_address: u8,
        map: RegisterMap,
        transport: Arc<dyn ModbusTransport>,
    ) -> Self {
        Self::with_buffer_capacity(device_address, map, transport, DEFAULT_INPUT_BUFFER_SIZE)
    }

    /// Create a slave with an explicit accumulation buffer capacity
    pub fn with_buffer_capacity(
        device_address: u8,
        map: RegisterMap,
        transport: Arc<dyn ModbusTransport>,
        buffer_capacity: usize,
    ) -> Self {
        Self {
            device_address,
            transport,
            last_transmit_ok: AtomicBool::new(true),
            inner: Mutex::new(SlaveInner {
                map,
                rx: ResyncBuffer::new(buffer_capacity),
            }),
        }
    }

    /// Configured device address
    pub fn device_address(&self) -> u8 {
        self.device_address
    }

    /// Whether the most recent transmission succeeded
    pub fn last_transmit_state(&self) -> bool {
        self.last_transmit_ok.load(Ordering::Relaxed)
    }

    /// Run a closure against the owned register map
    pub fn with_map<R>(&self, f: impl FnOnce(&mut RegisterMap) -> R) -> R {
        f(&mut self.inner.lock().map)
    }

    /// Feed received bytes into the engine.
    ///
    /// Callable from the transport's reader thread. Every frame that
    /// resynchronises out of the accumulated stream is dispatched before
    /// the call returns.
    pub fn on_bytes(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        inner.rx.push_bytes(bytes);

        while let Some(span) = scan_request(inner.rx.as_slice()) {
            if span.start > 0 {
                debug!(dropped = span.start, "skipped garbage before request frame");
            }
            let frame =
                inner.rx.as_slice()[span.start..span.start + span.len].to_vec();
            inner.rx.drain_front(span.start + span.len);
            self.process_frame(&mut inner, &frame);
        }
    }

    fn process_frame(&self, inner: &mut SlaveInner, frame: &[u8]) {
        let address = frame[0];
        if address != self.device_address && address != BROADCAST_ADDRESS {
            debug!(address, "request for another device dropped");
            return;
        }
        let function = frame[1];

        let response = match decode_request(frame) {
            Ok((_, request)) => match Self::execute(&mut inner.map, &request) {
                Ok(response) => response,
                Err(code) => {
                    warn!(function, exception = code.name(), "request rejected");
                    Response::Exception {
                        function,
                        code: code.code(),
                    }
                }
            },
            Err(ModbusError::InvalidFunction { code }) => {
                warn!(function = code, "unsupported function code");
                Response::Exception {
                    function: code,
                    code: ExceptionCode::IllegalFunction.code(),
                }
            }
            Err(err) => {
                warn!(%err, "resynchronised frame failed to decode");
                return;
            }
        };

        // broadcasts are processed but never answered
        if address == BROADCAST_ADDRESS {
            return;
        }

        let out = encode_response(address, &response);
        let sent = self.transport.send(&out);
        self.last_transmit_ok.store(sent, Ordering::Relaxed);
        if sent {
            debug!(bytes = out.len(), "response transmitted");
        } else {
            warn!("transport rejected response frame");
        }
    }

    fn execute(map: &mut RegisterMap, request: &Request) -> Result<Response, ExceptionCode> {
        match *request {
            Request::Read {
                function,
                start,
                quantity,
            } => {
                if function <= FC_READ_DISCRETE_INPUTS {
                    Self::read_bits(map, function, start, quantity)
                } else {
                    Self::read_registers(map, function, start, quantity)
                }
            }
            Request::WriteSingle {
                function,
                address,
                value,
            } => {
                if function == FC_WRITE_SINGLE_COIL {
                    Self::write_single_coil(map, address, value)
                } else {
                    Self::write_single_register(map, address, value)
                }
            }
            Request::WriteMultiple {
                function,
                start,
                quantity,
                ref payload,
            } => {
                if function == FC_WRITE_MULTIPLE_COILS {
                    Self::write_multiple_coils(map, start, quantity, payload)
                } else {
                    Self::write_multiple_registers(map, start, quantity, payload)
                }
            }
        }
    }

    fn check_address_range(start: u16, quantity: u16) -> Result<(), ExceptionCode> {
        if u32::from(start) + u32::from(quantity) - 1 > 0xFFFF {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }

    /// FC 01/02: each element contributes its least significant bit
    fn read_bits(
        map: &RegisterMap,
        function: u8,
        start: u16,
        quantity: u16,
    ) -> Result<Response, ExceptionCode> {
        if quantity == 0 || quantity > MAX_READ_BITS {
            return Err(ExceptionCode::IllegalDataValue);
        }
        Self::check_address_range(start, quantity)?;

        let mut bits = Vec::with_capacity(quantity as usize);
        for offset in 0..quantity {
            let mut byte = [0u8; 1];
            map.get_element_value(function, start + offset, &mut byte)
                .map_err(|_| ExceptionCode::IllegalDataAddress)?;
            bits.push(byte[0] & 0x01 != 0);
        }
        Ok(Response::ReadBits {
            function,
            data: pack_bits(&bits),
        })
    }

    /// FC 03/04: raw element bytes are appended in the order the map
    /// returns them and the byte count reflects the actual sum
    fn read_registers(
        map: &RegisterMap,
        function: u8,
        start: u16,
        quantity: u16,
    ) -> Result<Response, ExceptionCode> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(ExceptionCode::IllegalDataValue);
        }
        Self::check_address_range(start, quantity)?;

        let mut data = Vec::with_capacity(quantity as usize * 2);
        for offset in 0..quantity {
            let mut bytes = [0u8; 4];
            let written = map
                .get_element_value(function, start + offset, &mut bytes)
                .map_err(|_| ExceptionCode::IllegalDataAddress)?;
            data.extend_from_slice(&bytes[..written]);
        }
        Ok(Response::ReadRegisters { function, data })
    }

    fn write_single_coil(
        map: &mut RegisterMap,
        address: u16,
        value: u16,
    ) -> Result<Response, ExceptionCode> {
        if value != 0x0000 && value != 0xFF00 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let bit = u8::from(value == 0xFF00);
        map.set_element_value(FC_WRITE_SINGLE_COIL, address, &[bit])
            .map_err(|_| ExceptionCode::IllegalDataAddress)?;
        Ok(Response::WriteSingleEcho {
            function: FC_WRITE_SINGLE_COIL,
            address,
            value,
        })
    }

    fn write_single_register(
        map: &mut RegisterMap,
        address: u16,
        value: u16,
    ) -> Result<Response, ExceptionCode> {
        map.set_element_value(FC_WRITE_SINGLE_REGISTER, address, &value.to_le_bytes())
            .map_err(|_| ExceptionCode::IllegalDataAddress)?;
        Ok(Response::WriteSingleEcho {
            function: FC_WRITE_SINGLE_REGISTER,
            address,
            value,
        })
    }

    fn write_multiple_coils(
        map: &mut RegisterMap,
        start: u16,
        quantity: u16,
        payload: &[u8],
    ) -> Result<Response, ExceptionCode> {
        if quantity == 0 || quantity > MAX_WRITE_COILS {
            return Err(ExceptionCode::IllegalDataValue);
        }
        if payload.len() != (quantity as usize).div_ceil(8) {
            return Err(ExceptionCode::IllegalDataValue);
        }
        Self::check_address_range(start, quantity)?;

        for (offset, bit) in unpack_bits(payload, quantity as usize).into_iter().enumerate() {
            map.set_element_value(
                FC_WRITE_MULTIPLE_COILS,
                start + offset as u16,
                &[u8::from(bit)],
            )
            .map_err(|_| ExceptionCode::IllegalDataAddress)?;
        }
        Ok(Response::WriteMultipleEcho {
            function: FC_WRITE_MULTIPLE_COILS,
            start,
            quantity,
        })
    }

    fn write_multiple_registers(
        map: &mut RegisterMap,
        start: u16,
        quantity: u16,
        payload: &[u8],
    ) -> Result<Response, ExceptionCode> {
        if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
            return Err(ExceptionCode::IllegalDataValue);
        }
        if payload.len() != quantity as usize * 2 {
            return Err(ExceptionCode::IllegalDataValue);
        }
        Self::check_address_range(start, quantity)?;

        for offset in 0..quantity as usize {
            let value = u16::from_be_bytes([payload[offset * 2], payload[offset * 2 + 1]]);
            map.set_element_value(
                FC_WRITE_MULTIPLE_REGISTERS,
                start + offset as u16,
                &value.to_le_bytes(),
            )
            .map_err(|_| ExceptionCode::IllegalDataAddress)?;
        }
        Ok(Response::WriteMultipleEcho {
            function: FC_WRITE_MULTIPLE_REGISTERS,
            start,
            quantity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::crc16;
    use crate::value::{DataType, RegisterValue};

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_le_bytes());
        frame
    }

    fn test_map() -> RegisterMap {
        let mut map = RegisterMap::new();
        map.add_element(
            0x03,
            0x0010,
            DataType::UInt16,
            2,
            "Holding",
            0,
            RegisterValue::U16(0x1234),
            RegisterValue::U16(0),
            RegisterValue::U16(0xFFFF),
            Some(""),
        )
        .unwrap();
        map.add_element(
            0x05,
            0x0005,
            DataType::OneBit,
            1,
            "Coil",
            0,
            RegisterValue::U8(0),
            RegisterValue::U8(0),
            RegisterValue::U8(1),
            Some(""),
        )
        .unwrap();
        map
    }

    fn test_slave() -> (ModbusSlave, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let slave = ModbusSlave::new(0x01, test_map(), transport.clone());
        (slave, transport)
    }

    use crate::transport::MemoryTransport;

    #[test]
    fn test_read_holding_happy_path() {
        let (slave, transport) = test_slave();
        slave.on_bytes(&[0x01, 0x03, 0x00, 0x10, 0x00, 0x01, 0x85, 0xCF]);

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        // value bytes appear in map (little-endian host) order
        assert_eq!(&sent[0][..5], &[0x01, 0x03, 0x02, 0x34, 0x12]);
        assert_eq!(
            crc16(&sent[0][..5]).to_le_bytes(),
            [sent[0][5], sent[0][6]]
        );
        // register unchanged by the read
        slave.with_map(|map| {
            let mut out = [0u8; 2];
            map.get_element_value(0x03, 0x0010, &mut out).unwrap();
            assert_eq!(u16::from_le_bytes(out), 0x1234);
        });
    }

    #[test]
    fn test_write_single_coil_echo() {
        let (slave, transport) = test_slave();
        let request = [0x01, 0x05, 0x00, 0x05, 0xFF, 0x00, 0x9C, 0x3B];
        slave.on_bytes(&request);

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], request);
        slave.with_map(|map| {
            let mut out = [0u8; 1];
            map.get_element_value(0x05, 0x0005, &mut out).unwrap();
            assert_eq!(out[0], 0x01);
        });
    }

    #[test]
    fn test_garbage_prefix_then_valid_frame() {
        let (slave, transport) = test_slave();
        slave.on_bytes(&[0xDE, 0xAD, 0x01, 0x05, 0x00, 0x05, 0xFF, 0x00, 0x9C, 0x3B]);
        assert_eq!(transport.sent_count(), 1);
        // nothing left over to re-process
        slave.on_bytes(&[]);
        assert_eq!(transport.sent_count(), 1);
    }

    #[test]
    fn test_unknown_function_yields_exception() {
        let (slave, transport) = test_slave();
        slave.on_bytes(&with_crc(&[0x01, 0x07, 0x00, 0x00, 0x00, 0x00]));

        let sent = transport.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..3], &[0x01, 0x87, 0x01]);
        assert_eq!(sent[0].len(), EXCEPTION_FRAME_LEN);
    }

    #[test]
    fn test_wrong_address_dropped_silently() {
        let (slave, transport) = test_slave();
        slave.on_bytes(&with_crc(&[0x02, 0x03, 0x00, 0x10, 0x00, 0x01]));
        assert_eq!(transport.sent_count(), 0);
    }

    #[test]
    fn test_broadcast_processed_but_unanswered() {
        let transport = Arc::new(MemoryTransport::new());
        let mut map = RegisterMap::new();
        map.add_element(
            0x06,
            0x0001,
            DataType::UInt16,
            2,
            "Setpoint",
            0,
            RegisterValue::U16(0),
            RegisterValue::U16(0),
            RegisterValue::U16(1000),
            Some(""),
        )
        .unwrap();
        let slave = ModbusSlave::new(0x01, map, transport.clone());

        slave.on_bytes(&with_crc(&[0x00, 0x06, 0x00, 0x01, 0x00, 0x2A]));
        assert_eq!(transport.sent_count(), 0);
        slave.with_map(|map| {
            let mut out = [0u8; 2];
            map.get_element_value(0x06, 0x0001, &mut out).unwrap();
            assert_eq!(u16::from_le_bytes(out), 42);
        });
    }

    #[test]
    fn test_absent_address_yields_illegal_data_address() {
        let (slave, transport) = test_slave();
        slave.on_bytes(&with_crc(&[0x01, 0x03, 0x00, 0x99, 0x00, 0x01]));
        let sent = transport.sent_frames();
        assert_eq!(&sent[0][..3], &[0x01, 0x83, 0x02]);
    }

    #[test]
    fn test_excess_quantity_yields_illegal_data_value() {
        let (slave, transport) = test_slave();
        // 0x007E holding registers is one past the limit
        slave.on_bytes(&with_crc(&[0x01, 0x03, 0x00, 0x10, 0x00, 0x7E]));
        let sent = transport.sent_frames();
        assert_eq!(&sent[0][..3], &[0x01, 0x83, 0x03]);
    }

    #[test]
    fn test_bad_coil_value_yields_illegal_data_value() {
        let (slave, transport) = test_slave();
        slave.on_bytes(&with_crc(&[0x01, 0x05, 0x00, 0x05, 0x12, 0x34]));
        let sent = transport.sent_frames();
        assert_eq!(&sent[0][..3], &[0x01, 0x85, 0x03]);
    }

    #[test]
    fn test_write_multiple_registers() {
        let transport = Arc::new(MemoryTransport::new());
        let mut map = RegisterMap::new();
        for address in 0..2u16 {
            map.add_element(
                0x10,
                address,
                DataType::UInt16,
                2,
                "Block",
                0,
                RegisterValue::U16(0),
                RegisterValue::U16(0),
                RegisterValue::U16(0xFFFF),
                Some(""),
            )
            .unwrap();
        }
        let slave = ModbusSlave::new(0x01, map, transport.clone());

        slave.on_bytes(&with_crc(&[
            0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02,
        ]));

        let sent = transport.sent_frames();
        assert_eq!(&sent[0][..6], &[0x01, 0x10, 0x00, 0x00, 0x00, 0x02]);
        slave.with_map(|map| {
            let mut out = [0u8; 2];
            map.get_element_value(0x10, 0, &mut out).unwrap();
            assert_eq!(u16::from_le_bytes(out), 0x000A);
            map.get_element_value(0x10, 1, &mut out).unwrap();
            assert_eq!(u16::from_le_bytes(out), 0x0102);
        });
    }

    #[test]
    fn test_write_multiple_coils_bit_order() {
        let transport = Arc::new(MemoryTransport::new());
        let mut map = RegisterMap::new();
        for address in 0..10u16 {
            map.add_element(
                0x0F,
                address,
                DataType::OneBit,
                1,
                "Bank",
                0,
                RegisterValue::U8(0),
                RegisterValue::U8(0),
                RegisterValue::U8(1),
                Some(""),
            )
            .unwrap();
        }
        let slave = ModbusSlave::new(0x01, map, transport.clone());

        // 10 coils, pattern 0x01CD LSB-first
        slave.on_bytes(&with_crc(&[
            0x01, 0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0xCD, 0x01,
        ]));

        assert_eq!(transport.sent_count(), 1);
        let expected = [true, false, true, true, false, false, true, true, true, false];
        slave.with_map(|map| {
            for (address, want) in expected.iter().enumerate() {
                let mut out = [0u8; 1];
                map.get_element_value(0x0F, address as u16, &mut out).unwrap();
                assert_eq!(out[0] != 0, *want, "coil {address}");
            }
        });
    }

    #[test]
    fn test_two_frames_in_one_delivery() {
        let (slave, transport) = test_slave();
        let mut stream = with_crc(&[0x01, 0x03, 0x00, 0x10, 0x00, 0x01]);
        stream.extend(with_crc(&[0x01, 0x05, 0x00, 0x05, 0xFF, 0x00]));
        slave.on_bytes(&stream);
        assert_eq!(transport.sent_count(), 2);
    }

    #[test]
    fn test_send_failure_recorded() {
        let (slave, transport) = test_slave();
        transport.set_fail_sends(true);
        slave.on_bytes(&[0x01, 0x03, 0x00, 0x10, 0x00, 0x01, 0x85, 0xCF]);
        assert!(!slave.last_transmit_state());
    }
}
