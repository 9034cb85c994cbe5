//! # Stream Resynchronisation
//!
//! Modbus RTU has no framing character; the wire protocol relies on
//! inter-character timing that an arbitrary byte transport does not
//! preserve. The engines therefore locate frame boundaries with a
//! candidate scan: starting at the oldest byte, each offset is tried
//! against every frame variant the role can receive, and a candidate
//! matches only when its function-code byte fits the variant and the
//! trailing little-endian CRC verifies over the declared length.
//!
//! Variable-length variants carry their own length field; when that field
//! claims more bytes than have arrived, the scan reports "not enough data
//! yet" instead of treating the candidate as a mismatch, so a frame split
//! across transport deliveries is never skipped.

use tracing::warn;

use crate::constants::*;
use crate::crc::frame_crc_ok;

/// Location of one validated frame inside the accumulation buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpan {
    /// Offset of the frame's first byte; everything before it is garbage
    pub start: usize,
    /// Total frame length, CRC included
    pub len: usize,
}

/// Bounded accumulation FIFO for received bytes.
///
/// When full, the oldest bytes are dropped to make room; the transport is
/// never back-pressured.
#[derive(Debug)]
pub struct ResyncBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl ResyncBuffer {
    /// Create a buffer bounded at `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity.min(DEFAULT_INPUT_BUFFER_SIZE)),
            capacity,
        }
    }

    /// Configured capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current fill level
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no bytes are buffered
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Buffered bytes, oldest first
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append received bytes, dropping the oldest on overflow
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.capacity {
            warn!(
                dropped = self.data.len() + bytes.len() - self.capacity,
                "input burst exceeds buffer capacity"
            );
            self.data.clear();
            self.data
                .extend_from_slice(&bytes[bytes.len() - self.capacity..]);
            return;
        }
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            warn!(dropped = overflow, "accumulation buffer full, dropping oldest bytes");
            self.data.drain(..overflow);
        }
        self.data.extend_from_slice(bytes);
    }

    /// Drop the `count` oldest bytes (consumed frame or garbage prefix)
    pub fn drain_front(&mut self, count: usize) {
        let count = count.min(self.data.len());
        self.data.drain(..count);
    }
}

impl Default for ResyncBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_BUFFER_SIZE)
    }
}

// ============================================================================
// Candidate scanners
// ============================================================================

/// Locate the next valid request frame in slave role.
///
/// Fixed eight-byte frames are accepted for every function code other than
/// 0F/10 so that an unknown function with a valid CRC still reaches the
/// dispatcher and can be answered with ILLEGAL FUNCTION. 0F/10 use the
/// variable layout with the CRC at `7 + byte_count`.
pub fn scan_request(buf: &[u8]) -> Option<FrameSpan> {
    let len = buf.len();
    if len < REQUEST_FRAME_LEN {
        return None;
    }
    let mut start = 0;
    while start + REQUEST_FRAME_LEN <= len {
        let function = buf[start + 1];
        if function == FC_WRITE_MULTIPLE_COILS || function == FC_WRITE_MULTIPLE_REGISTERS {
            let byte_count = buf[start + WRITE_MULTI_HEADER_LEN - 1] as usize;
            let total = WRITE_MULTI_HEADER_LEN + byte_count + CRC_LEN;
            if start + total > len {
                // length field points past the received bytes; wait
                return None;
            }
            if frame_crc_ok(&buf[start..start + total]) {
                return Some(FrameSpan { start, len: total });
            }
        } else if frame_crc_ok(&buf[start..start + REQUEST_FRAME_LEN]) {
            return Some(FrameSpan {
                start,
                len: REQUEST_FRAME_LEN,
            });
        }
        start += 1;
    }
    None
}

/// Locate the next valid response frame in master role.
///
/// Accepts read responses (byte-count driven), single/multiple write echoes
/// and exception frames whose low seven bits equal the awaited function
/// code.
pub fn scan_response(buf: &[u8], awaited_function: u8) -> Option<FrameSpan> {
    let len = buf.len();
    if len < EXCEPTION_FRAME_LEN {
        return None;
    }
    let mut start = 0;
    while start + EXCEPTION_FRAME_LEN <= len {
        let function = buf[start + 1];
        match function {
            FC_READ_COILS..=FC_READ_INPUT_REGISTERS => {
                let byte_count = buf[start + READ_RESPONSE_HEADER_LEN - 1] as usize;
                let total = READ_RESPONSE_HEADER_LEN + byte_count + CRC_LEN;
                if start + total > len {
                    return None;
                }
                if frame_crc_ok(&buf[start..start + total]) {
                    return Some(FrameSpan { start, len: total });
                }
            }
            FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS => {
                if start + REQUEST_FRAME_LEN > len {
                    return None;
                }
                if frame_crc_ok(&buf[start..start + REQUEST_FRAME_LEN]) {
                    return Some(FrameSpan {
                        start,
                        len: REQUEST_FRAME_LEN,
                    });
                }
            }
            _ => {
                if function & EXCEPTION_FLAG != 0
                    && function & !EXCEPTION_FLAG == awaited_function
                    && frame_crc_ok(&buf[start..start + EXCEPTION_FRAME_LEN])
                {
                    return Some(FrameSpan {
                        start,
                        len: EXCEPTION_FRAME_LEN,
                    });
                }
            }
        }
        start += 1;
    }
    None
}
