//! Frame codec for the DP100 HID protocol.
//!
//! Every exchange is carried in a single 64-byte HID report:
//!
//! `[marker:1][opcode:1][reserved:1][length:1][payload:length][crc_lo:1][crc_hi:1]`
//!
//! The trailer is a CRC-16 (reflected, polynomial `0xA001`, initial value
//! `0xFFFF`, no final XOR) over all preceding bytes, appended little-endian.
//! A frame whose checksum does not match is invalid as a whole; its payload
//! bytes must never be trusted.

use strum_macros::{EnumIter, FromRepr};

/// Fixed HID report size used by the device in both directions.
pub const REPORT_LEN: usize = 64;
/// Marker byte on frames sent host to device.
pub const HOST_MARKER: u8 = 0xFB;
/// Marker byte on frames sent device to host.
pub const DEVICE_MARKER: u8 = 0xFA;

const HEADER_LEN: usize = 4;
const CRC_LEN: usize = 2;

/// Largest payload that fits a single report alongside header and checksum.
pub const MAX_PAYLOAD: usize = REPORT_LEN - HEADER_LEN - CRC_LEN;

/// Function codes understood by the DP100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, FromRepr)]
#[repr(u8)]
pub enum Opcode {
    /// Model name, version numbers and manufacture date.
    DeviceInfo = 0x10,
    /// Live telemetry snapshot.
    BasicInfo = 0x30,
    /// Output setpoint apply, and preset group read/write.
    BasicSet = 0x35,
    /// System settings record, read and write.
    SystemInfo = 0x40,
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value as u8
    }
}

/// Compute the CRC-16 checksum of `data`.
///
/// Reflected form: each byte is XORed into the low end of the register, then
/// the register is shifted right eight times, folding in the bit-reversed
/// polynomial `0xA001` whenever the shifted-out bit is set.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// A validated frame: checksum already checked, length consistent.
///
/// Inbound frames may carry opcodes this crate does not know, so the opcode
/// is kept raw. Compare against [`Opcode`] via `u8::from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub marker: u8,
    pub opcode: u8,
    pub payload: heapless::Vec<u8, MAX_PAYLOAD>,
}

/// Build the wire bytes for a host-to-device frame.
///
/// Returns `None` if the payload does not fit a single report.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Option<heapless::Vec<u8, REPORT_LEN>> {
    if payload.len() > MAX_PAYLOAD {
        return None;
    }

    let mut raw: heapless::Vec<u8, REPORT_LEN> = heapless::Vec::new();
    // Capacity is checked above, these cannot fail.
    raw.extend_from_slice(&[HOST_MARKER, opcode.into(), 0x00, payload.len() as u8])
        .ok()?;
    raw.extend_from_slice(payload).ok()?;
    let crc = crc16(&raw);
    raw.extend_from_slice(&crc.to_le_bytes()).ok()?;
    Some(raw)
}

/// Parse and validate an inbound byte buffer.
///
/// Returns `None` on any short buffer, length inconsistency or checksum
/// mismatch. Decode failure is an expected outcome of noisy or partial HID
/// reads, so it is a value, not an error.
pub fn decode(raw: &[u8]) -> Option<Frame> {
    if raw.len() < HEADER_LEN + CRC_LEN {
        return None;
    }

    let length = raw[3] as usize;
    let total = HEADER_LEN + length + CRC_LEN;
    if length > MAX_PAYLOAD || raw.len() < total {
        return None;
    }

    let appended = u16::from_le_bytes([raw[total - 2], raw[total - 1]]);
    if crc16(&raw[..total - CRC_LEN]) != appended {
        return None;
    }

    let payload = heapless::Vec::from_slice(&raw[HEADER_LEN..HEADER_LEN + length]).ok()?;
    Some(Frame {
        marker: raw[0],
        opcode: raw[1],
        payload,
    })
}
