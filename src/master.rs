//! # Master Engine
//!
//! Emits requests, arms a response timer, parses responses into the
//! register map and retries on timeout. At most one request is in flight at
//! a time.
//!
//! ## Threading
//!
//! Three threads touch the engine: the caller issuing `send_*`, the
//! transport reader delivering `on_bytes`, and the timer thread delivering
//! `on_timeout`. The state tag is an atomic with acquire/release ordering;
//! the accumulation buffer, register map and last-request record share one
//! mutex, and a condvar signalled on every transition out of `Busy` lets
//! [`ModbusMaster::refresh_all`] block instead of spinning.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{encode_request, exception_name, pack_bits, unpack_bits, Request};
use crate::regmap::RegisterMap;
use crate::resync::{scan_response, ResyncBuffer};
use crate::timer::{TimeoutTimer, TimerHandle};
use crate::transport::ModbusTransport;

/// Master engine state tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MasterState {
    /// No request outstanding; incoming bytes are dropped
    Free = 0,
    /// One request in flight, response timer armed
    Busy = 1,
    /// A response has been parsed and applied; the next request resets
    ResponseReady = 2,
}

impl MasterState {
    fn from_tag(tag: u8) -> MasterState {
        match tag {
            1 => MasterState::Busy,
            2 => MasterState::ResponseReady,
            _ => MasterState::Free,
        }
    }
}

/// Everything retained about the request in flight
struct LastRequest {
    function: u8,
    /// Exact transmitted bytes, reused verbatim on retransmission
    frame: Vec<u8>,
    attempts_left: u32,
    timer: Option<TimerHandle>,
}

struct MasterInner {
    map: RegisterMap,
    rx: ResyncBuffer,
    last_request: Option<LastRequest>,
}

/// Modbus RTU master engine
pub struct ModbusMaster {
    device_address: u8,
    response_timeout: Duration,
    attempts: u32,
    state: AtomicU8,
    last_transmit_ok: AtomicBool,
    transport: Arc<dyn ModbusTransport>,
    timer: Arc<dyn TimeoutTimer>,
    inner: Mutex<MasterInner>,
    state_changed: Condvar,
    /// Self-reference handed to timer callbacks so an expired timer cannot
    /// keep the engine alive
    weak_self: Weak<ModbusMaster>,
}

impl ModbusMaster {
    /// Create a master with the default timeout, retry budget and buffer
    pub fn new(
        device_address: u8,
        map: RegisterMap,
        transport: Arc<dyn ModbusTransport>,
        timer: Arc<dyn TimeoutTimer>,
    ) -> Arc<Self> {
        Self::with_timing(
            device_address,
            map,
            transport,
            timer,
            Duration::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS),
            DEFAULT_ATTEMPTS,
            DEFAULT_INPUT_BUFFER_SIZE,
        )
    }

    /// Create a master with explicit timing and buffer parameters
    pub fn with_timing(
        device_address: u8,
        map: RegisterMap,
        transport: Arc<dyn ModbusTransport>,
        timer: Arc<dyn TimeoutTimer>,
        response_timeout: Duration,
        attempts: u32,
        buffer_capacity: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            device_address,
            response_timeout,
            attempts,
            state: AtomicU8::new(MasterState::Free as u8),
            last_transmit_ok: AtomicBool::new(true),
            transport,
            timer,
            inner: Mutex::new(MasterInner {
                map,
                rx: ResyncBuffer::new(buffer_capacity),
                last_request: None,
            }),
            state_changed: Condvar::new(),
            weak_self: weak_self.clone(),
        })
    }

    /// Address of the slave this master talks to
    pub fn device_address(&self) -> u8 {
        self.device_address
    }

    /// Current state tag
    pub fn state(&self) -> MasterState {
        MasterState::from_tag(self.state.load(Ordering::Acquire))
    }

    /// Whether the most recent transmission succeeded
    pub fn last_transmit_state(&self) -> bool {
        self.last_transmit_ok.load(Ordering::Relaxed)
    }

    /// Run a closure against the owned register map
    pub fn with_map<R>(&self, f: impl FnOnce(&mut RegisterMap) -> R) -> R {
        f(&mut self.inner.lock().map)
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Issue a read request (FC 01-04) and arm the response timer
    pub fn send_read(
        &self,
        function: u8,
        start: u16,
        quantity: u16,
    ) -> ModbusResult<()> {
        if !(FC_READ_COILS..=FC_READ_INPUT_REGISTERS).contains(&function) {
            return Err(ModbusError::InvalidFunction { code: function });
        }
        let limit = if function <= FC_READ_DISCRETE_INPUTS {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        };
        if quantity == 0 || quantity > limit {
            return Err(ModbusError::invalid_data(format!(
                "read quantity {quantity} outside 1..={limit}"
            )));
        }

        self.acquire_engine()?;
        let mut inner = self.inner.lock();
        let frame = match encode_request(
            self.device_address,
            &Request::Read {
                function,
                start,
                quantity,
            },
        ) {
            Ok(frame) => frame,
            Err(err) => {
                self.abort_request(&mut inner);
                return Err(err);
            }
        };
        self.dispatch(&mut inner, function, frame)
    }

    /// Issue a single write (FC 05/06) with the current map value and arm
    /// the response timer.
    ///
    /// For FC05 a truthy map value is coerced to 0xFF00, anything else to
    /// 0x0000.
    pub fn send_write_single(&self, function: u8, address: u16) -> ModbusResult<()> {
        if function != FC_WRITE_SINGLE_COIL && function != FC_WRITE_SINGLE_REGISTER {
            return Err(ModbusError::InvalidFunction { code: function });
        }

        self.acquire_engine()?;
        let mut inner = self.inner.lock();
        let value = match Self::read_map_u16(&inner.map, function, address) {
            Ok(raw) => {
                if function == FC_WRITE_SINGLE_COIL {
                    if raw != 0 {
                        0xFF00
                    } else {
                        0x0000
                    }
                } else {
                    raw
                }
            }
            Err(err) => {
                self.abort_request(&mut inner);
                return Err(err);
            }
        };
        let frame = match encode_request(
            self.device_address,
            &Request::WriteSingle {
                function,
                address,
                value,
            },
        ) {
            Ok(frame) => frame,
            Err(err) => {
                self.abort_request(&mut inner);
                return Err(err);
            }
        };
        self.dispatch(&mut inner, function, frame)
    }

    /// Issue a multiple write (FC 0F/10) with the current map values and
    /// arm the response timer
    pub fn send_write_multiple(
        &self,
        function: u8,
        start: u16,
        quantity: u16,
    ) -> ModbusResult<()> {
        if function != FC_WRITE_MULTIPLE_COILS && function != FC_WRITE_MULTIPLE_REGISTERS {
            return Err(ModbusError::InvalidFunction { code: function });
        }
        let limit = if function == FC_WRITE_MULTIPLE_COILS {
            MAX_WRITE_COILS
        } else {
            MAX_WRITE_REGISTERS
        };
        if quantity == 0 || quantity > limit {
            return Err(ModbusError::invalid_data(format!(
                "write quantity {quantity} outside 1..={limit}"
            )));
        }

        self.acquire_engine()?;
        let mut inner = self.inner.lock();
        let payload = match Self::collect_payload(&inner.map, function, start, quantity) {
            Ok(payload) => payload,
            Err(err) => {
                self.abort_request(&mut inner);
                return Err(err);
            }
        };
        let frame = match encode_request(
            self.device_address,
            &Request::WriteMultiple {
                function,
                start,
                quantity,
                payload,
            },
        ) {
            Ok(frame) => frame,
            Err(err) => {
                self.abort_request(&mut inner);
                return Err(err);
            }
        };
        self.dispatch(&mut inner, function, frame)
    }

    /// Refresh every readable element of the map with one single-register
    /// read per key.
    ///
    /// Collects the keys first, then blocks on each request until the
    /// engine leaves `Busy`; a request abandoned after exhausted retries
    /// aborts the refresh.
    pub fn refresh_all(&self) -> ModbusResult<()> {
        let keys: Vec<(u8, u16)> = {
            let inner = self.inner.lock();
            inner
                .map
                .iter()
                .filter(|e| {
                    (FC_READ_COILS..=FC_READ_INPUT_REGISTERS).contains(&e.function_code())
                })
                .map(|e| (e.function_code(), e.address()))
                .collect()
        };

        // worst case: the initial transmission plus every retry times out
        let wait_budget =
            self.response_timeout * (self.attempts + 1) + Duration::from_millis(500);

        for (function, address) in keys {
            self.send_read(function, address, 1)?;

            let mut inner = self.inner.lock();
            let deadline = Instant::now() + wait_budget;
            while self.state() == MasterState::Busy {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let _ = self.state_changed.wait_for(&mut inner, remaining);
            }
            drop(inner);

            if self.state() != MasterState::ResponseReady {
                return Err(ModbusError::protocol(format!(
                    "refresh abandoned at fc={function:#04x} addr={address:#06x}"
                )));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Inbound paths (reader thread, timer thread)
    // ========================================================================

    /// Feed received bytes into the engine.
    ///
    /// Callable from the transport's reader thread. Bytes arriving while no
    /// request is outstanding are dropped.
    pub fn on_bytes(&self, bytes: &[u8]) {
        if self.state() != MasterState::Busy {
            debug!(count = bytes.len(), "master idle, dropping received bytes");
            return;
        }
        let mut inner = self.inner.lock();
        let awaited = match &inner.last_request {
            Some(request) => request.function,
            None => return,
        };
        inner.rx.push_bytes(bytes);

        while let Some(span) = scan_response(inner.rx.as_slice(), awaited) {
            if span.start > 0 {
                debug!(dropped = span.start, "skipped garbage before response frame");
            }
            let frame =
                inner.rx.as_slice()[span.start..span.start + span.len].to_vec();
            inner.rx.drain_front(span.start + span.len);
            if self.process_response(&mut inner, &frame) {
                break;
            }
        }
    }

    /// Timer expiry entry point: retransmit or abandon.
    ///
    /// Callable from the timer thread; a stale expiry after the response
    /// arrived is a no-op because the state already left `Busy`.
    pub fn on_timeout(&self) {
        let mut inner = self.inner.lock();
        if self.state() != MasterState::Busy {
            return;
        }
        let Some(request) = inner.last_request.as_ref() else {
            self.transition(MasterState::Free);
            return;
        };
        warn!(
            function = request.function,
            attempts_left = request.attempts_left,
            "response timeout expired"
        );

        if request.attempts_left == 0 {
            inner.last_request = None;
            self.transition(MasterState::Free);
            return;
        }

        let frame = request.frame.clone();
        if !self.transport.send(&frame) {
            error!("retransmission rejected by transport");
            self.last_transmit_ok.store(false, Ordering::Relaxed);
            self.abort_request(&mut inner);
            return;
        }
        self.last_transmit_ok.store(true, Ordering::Relaxed);

        let Some(handle) = self.arm_response_timer() else {
            error!("failed to re-arm response timer");
            self.abort_request(&mut inner);
            return;
        };
        let request = inner
            .last_request
            .as_mut()
            .expect("request present: checked above under the same lock");
        request.attempts_left -= 1;
        request.timer = Some(handle);
        debug!(attempts_left = request.attempts_left, "request retransmitted");
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Claim the engine for a new request: `Free -> Busy`, with
    /// `ResponseReady` collapsing to `Free` first
    fn acquire_engine(&self) -> ModbusResult<()> {
        loop {
            match self.state.compare_exchange(
                MasterState::Free as u8,
                MasterState::Busy as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(tag) if tag == MasterState::ResponseReady as u8 => {
                    let _ = self.state.compare_exchange(
                        MasterState::ResponseReady as u8,
                        MasterState::Free as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                Err(_) => return Err(ModbusError::Busy),
            }
        }
    }

    /// Store tag and wake any waiter in `refresh_all`; callers hold the
    /// inner mutex so waiters observe consistent request state
    fn transition(&self, state: MasterState) {
        self.state.store(state as u8, Ordering::Release);
        self.state_changed.notify_all();
    }

    fn abort_request(&self, inner: &mut MasterInner) {
        inner.last_request = None;
        self.transition(MasterState::Free);
    }

    fn arm_response_timer(&self) -> Option<TimerHandle> {
        let weak = self.weak_self.clone();
        self.timer.arm(
            self.response_timeout,
            Box::new(move || {
                if let Some(master) = weak.upgrade() {
                    master.on_timeout();
                }
            }),
        )
    }

    fn dispatch(
        &self,
        inner: &mut MasterInner,
        function: u8,
        frame: Vec<u8>,
    ) -> ModbusResult<()> {
        inner.last_request = None;

        if !self.transport.send(&frame) {
            self.last_transmit_ok.store(false, Ordering::Relaxed);
            self.transition(MasterState::Free);
            return Err(ModbusError::transport("request rejected by transport"));
        }
        self.last_transmit_ok.store(true, Ordering::Relaxed);

        let Some(handle) = self.arm_response_timer() else {
            self.transition(MasterState::Free);
            return Err(ModbusError::timer("failed to arm response timer"));
        };

        inner.last_request = Some(LastRequest {
            function,
            frame,
            attempts_left: self.attempts,
            timer: Some(handle),
        });
        debug!(function, "request transmitted");
        Ok(())
    }

    /// Read a register-sized value out of the map; OneBit elements widen
    /// from their single byte
    fn read_map_u16(map: &RegisterMap, function: u8, address: u16) -> ModbusResult<u16> {
        let mut bytes = [0u8; 4];
        let written = map.get_element_value(function, address, &mut bytes)?;
        match written {
            1 => Ok(u16::from(bytes[0])),
            2 => Ok(u16::from_le_bytes([bytes[0], bytes[1]])),
            _ => Err(ModbusError::invalid_data(format!(
                "element at fc={function:#04x} addr={address:#06x} is not register sized"
            ))),
        }
    }

    fn collect_payload(
        map: &RegisterMap,
        function: u8,
        start: u16,
        quantity: u16,
    ) -> ModbusResult<Vec<u8>> {
        if function == FC_WRITE_MULTIPLE_COILS {
            let mut bits = Vec::with_capacity(quantity as usize);
            for offset in 0..quantity {
                let mut byte = [0u8; 1];
                map.get_element_value(function, start + offset, &mut byte)?;
                bits.push(byte[0] & 0x01 != 0);
            }
            Ok(pack_bits(&bits))
        } else {
            let mut payload = Vec::with_capacity(quantity as usize * 2);
            for offset in 0..quantity {
                let value = Self::read_map_u16(map, function, start + offset)?;
                payload.extend_from_slice(&value.to_be_bytes());
            }
            Ok(payload)
        }
    }

    /// Apply one resynchronised frame; returns `true` when the in-flight
    /// request is settled and scanning should stop
    fn process_response(&self, inner: &mut MasterInner, frame: &[u8]) -> bool {
        let address = frame[0];
        let function = frame[1];

        let Some(request) = inner.last_request.as_ref() else {
            return true;
        };
        if address != self.device_address || function & !EXCEPTION_FLAG != request.function {
            debug!(address, "mismatched response frame dropped");
            return false;
        }

        let request_frame = request.frame.clone();
        let handle = inner
            .last_request
            .as_mut()
            .expect("request present: checked above under the same lock")
            .timer
            .take();
        if let Some(handle) = handle {
            if !self.timer.cancel(handle) {
                error!("response timer cancel failed");
                self.abort_request(inner);
                return true;
            }
        }

        match Self::apply_response(&mut inner.map, &request_frame, frame) {
            Ok(()) => debug!(function, "response applied"),
            Err(err) => error!(%err, "response discarded"),
        }

        inner.last_request = None;
        self.transition(MasterState::ResponseReady);
        true
    }

    fn apply_response(
        map: &mut RegisterMap,
        request_frame: &[u8],
        frame: &[u8],
    ) -> ModbusResult<()> {
        let function = frame[1];
        if function & EXCEPTION_FLAG != 0 {
            let request_function = function & !EXCEPTION_FLAG;
            let code = frame[2];
            warn!(
                function = request_function,
                code,
                name = exception_name(code),
                "slave answered with exception"
            );
            return Err(ModbusError::Exception {
                function: request_function,
                code,
            });
        }

        let start = u16::from_be_bytes([request_frame[2], request_frame[3]]);
        let quantity = u16::from_be_bytes([request_frame[4], request_frame[5]]);

        match function {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
                let byte_count = frame[2] as usize;
                if byte_count != (quantity as usize).div_ceil(8) {
                    return Err(ModbusError::protocol(
                        "bit response byte count does not match request",
                    ));
                }
                let bits = unpack_bits(&frame[3..3 + byte_count], quantity as usize);
                for (offset, bit) in bits.into_iter().enumerate() {
                    map.set_element_value(function, start + offset as u16, &[u8::from(bit)])?;
                }
            }
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
                let byte_count = frame[2] as usize;
                if byte_count != quantity as usize * 2 {
                    return Err(ModbusError::protocol(
                        "register response byte count does not match request",
                    ));
                }
                for offset in 0..quantity as usize {
                    let value =
                        u16::from_be_bytes([frame[3 + offset * 2], frame[4 + offset * 2]]);
                    map.set_element_value(
                        function,
                        start + offset as u16,
                        &value.to_le_bytes(),
                    )?;
                }
            }
            FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER => {
                if frame[..6] != request_frame[..6] {
                    return Err(ModbusError::protocol("single write echo mismatch"));
                }
            }
            FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
                let echo_start = u16::from_be_bytes([frame[2], frame[3]]);
                let echo_quantity = u16::from_be_bytes([frame[4], frame[5]]);
                if echo_start != start || echo_quantity != quantity {
                    return Err(ModbusError::protocol("multi write echo mismatch"));
                }
            }
            _ => return Err(ModbusError::InvalidFunction { code: function }),
        }
        Ok(())
    }
}
