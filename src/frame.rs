//! Wire frame encoding and decoding.
//!
//! Every frame is `0x5A | PCW (4 bytes BE) | [RS-485 address] | length (u16 BE)
//! | payload | CRC-16 (u16 BE)`. The protocol control word carries the protocol
//! type and version in its top two bytes, an RS-485 flag, a notification flag,
//! and the message category and code in its low two bytes. The CRC covers
//! everything between the header byte and the checksum itself.

use log::{debug, warn};

use crate::types::FrameError;

pub const FRAME_HEADER: u8 = 0x5A;
const PROTO_TYPE: u8 = 0x00;
const PROTO_VERSION: u8 = 0x01;

/// Smallest possible frame: header + PCW + length + CRC
const MIN_FRAME_LEN: usize = 9;

/// Notification codes that signal the end of an inventory round
pub const READ_END_CODES: [u8; 3] = [0x01, 0x21, 0x31];

/// Category of tag notification frames
pub const TAG_NOTIFY_CATEGORY: u8 = 0x02;
/// Code of tag notification frames
pub const TAG_NOTIFY_CODE: u8 = 0x10;

/// Code the reader uses for a generic command rejection
pub const GENERIC_ERROR_CODE: u8 = 0x00;

/// Message identifiers, addressed by (category, code).
///
/// Some codes are shared between operations that differ only in payload
/// shape (0x02/0x03 configures antennas or the RF band, 0x02/0x0A queries
/// the filter or selects a profile), so the variants carry no discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mid {
    QueryInfo,
    BuzzerSwitch,
    ConfigurePower,
    QueryPower,
    ConfigureAntennas,
    SetRfBand,
    QueryRfBand,
    QueryWorkingFrequency,
    SetFilter,
    QueryFilter,
    SelectProfile,
    ConfigureBaseband,
    QueryBaseband,
    ReadEpcTag,
    WriteEpcTag,
    StopInventory,
    QueryRfidAbility,
}

impl Mid {
    pub fn category(&self) -> u8 {
        match self {
            Mid::QueryInfo | Mid::BuzzerSwitch => 0x01,
            Mid::QueryRfidAbility => 0x10,
            _ => 0x02,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Mid::QueryInfo => 0x00,
            Mid::BuzzerSwitch => 0x1E,
            Mid::ConfigurePower => 0x01,
            Mid::QueryPower => 0x02,
            Mid::ConfigureAntennas | Mid::SetRfBand => 0x03,
            Mid::QueryRfBand => 0x04,
            Mid::QueryWorkingFrequency => 0x06,
            Mid::SetFilter => 0x09,
            Mid::QueryFilter | Mid::SelectProfile => 0x0A,
            Mid::ConfigureBaseband => 0x0B,
            Mid::QueryBaseband => 0x0C,
            Mid::ReadEpcTag => 0x10,
            Mid::WriteEpcTag => 0x11,
            Mid::StopInventory => 0xFF,
            Mid::QueryRfidAbility => 0x00,
        }
    }
}

/// Map a generic-error payload byte to a human-readable reason
pub fn device_error_reason(code: u8) -> &'static str {
    match code {
        0x01 => "instruction not supported",
        0x02 => "CRC error or wrong mode",
        0x03 => "parameter error",
        0x04 => "device busy",
        0x05 => "command not valid in current state",
        _ => "unspecified error",
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Set on unsolicited notifications, clear on command responses
    pub notify: bool,
    pub rs485: bool,
    /// Present only when the RS-485 flag is set
    pub address: Option<u8>,
    pub category: u8,
    pub code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// True when this frame is the reply to a command with the given mid.
    ///
    /// Category 0x10 occupies the notify flag's bit in the control word, so
    /// ability replies arrive with the flag apparently set and the category
    /// bits reading zero. They are matched on that raw pattern.
    pub fn answers(&self, mid: Mid) -> bool {
        if mid.category() == 0x10 {
            self.notify && self.category == 0x00 && self.code == mid.code()
        } else {
            !self.notify && self.category == mid.category() && self.code == mid.code()
        }
    }

    /// True for unsolicited tag detection notifications
    pub fn is_tag_notification(&self) -> bool {
        self.notify && self.category == TAG_NOTIFY_CATEGORY && self.code == TAG_NOTIFY_CODE
    }

    /// True for the notification that closes an inventory round
    pub fn is_read_end(&self) -> bool {
        self.notify && self.category == TAG_NOTIFY_CATEGORY && READ_END_CODES.contains(&self.code)
    }
}

/// CRC-16 with polynomial 0x8005, zero initial value, MSB first
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x8005;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Encode a command frame for the given mid
pub fn build_frame(mid: Mid, payload: &[u8], rs485_address: Option<u8>, notify: bool) -> Vec<u8> {
    let mut pcw: u32 = ((PROTO_TYPE as u32) << 24)
        | ((PROTO_VERSION as u32) << 16)
        | ((mid.category() as u32) << 8)
        | (mid.code() as u32);
    if rs485_address.is_some() {
        pcw |= 1 << 13;
    }
    if notify {
        pcw |= 1 << 12;
    }

    let mut frame = Vec::with_capacity(MIN_FRAME_LEN + 1 + payload.len());
    frame.push(FRAME_HEADER);
    frame.extend_from_slice(&pcw.to_be_bytes());
    if let Some(addr) = rs485_address {
        frame.push(addr);
    }
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(payload);

    let crc = crc16(&frame[1..]);
    frame.extend_from_slice(&crc.to_be_bytes());
    frame
}

/// Decode one complete frame from `data`, which must start at the header byte
pub fn parse_frame(data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort(data.len()));
    }
    if data[0] != FRAME_HEADER {
        return Err(FrameError::BadHeader(data[0]));
    }

    let pcw = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let rs485 = pcw & (1 << 13) != 0;
    let notify = pcw & (1 << 12) != 0;
    // The flag bits sit inside the category byte, so they are masked out here
    // and carried separately.
    let category = ((pcw >> 8) & 0xCF) as u8;
    let code = (pcw & 0xFF) as u8;

    let mut offset = 5;
    let address = if rs485 {
        if data.len() < MIN_FRAME_LEN + 1 {
            return Err(FrameError::Truncated);
        }
        offset += 1;
        Some(data[5])
    } else {
        None
    };

    let payload_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
    let payload_start = offset + 2;
    let crc_start = payload_start + payload_len;
    if data.len() < crc_start + 2 {
        return Err(FrameError::Truncated);
    }

    let computed = crc16(&data[1..crc_start]);
    let received = u16::from_be_bytes([data[crc_start], data[crc_start + 1]]);
    if computed != received {
        return Err(FrameError::CrcMismatch { computed, received });
    }

    Ok(Frame {
        notify,
        rs485,
        address,
        category,
        code,
        payload: data[payload_start..crc_start].to_vec(),
    })
}

/// Total length of the frame starting at `data[0]`, or None if the length
/// field has not arrived yet
fn frame_len_at(data: &[u8]) -> Option<usize> {
    // Bit 13 of the PCW lives in its third byte.
    let pcw_rs485 = data.get(3).map(|b| b & 0x20 != 0)?;
    let len_offset = if pcw_rs485 { 6 } else { 5 };
    if data.len() < len_offset + 2 {
        return None;
    }
    let payload_len = u16::from_be_bytes([data[len_offset], data[len_offset + 1]]) as usize;
    Some(len_offset + 2 + payload_len + 2)
}

/// Scan a receive buffer for complete frames.
///
/// Returns the decoded frames together with the number of bytes the caller
/// should drop from the front of its buffer. Bytes belonging to a trailing
/// incomplete frame are left unconsumed so the next read can complete it.
/// A frame with a bad CRC is skipped one byte past its header, which lets a
/// valid frame whose 0x5A happened to appear inside the garbage be recovered.
pub fn extract_valid_frames(data: &[u8]) -> (Vec<Frame>, usize) {
    let mut frames = Vec::new();
    let mut i = 0usize;
    let mut consumed = 0usize;

    while i < data.len() {
        if data[i] != FRAME_HEADER {
            i += 1;
            consumed = i;
            continue;
        }

        match frame_len_at(&data[i..]) {
            None => {
                // Header seen but the length field is still in flight.
                consumed = i;
                break;
            }
            Some(full_len) => {
                if i + full_len > data.len() {
                    consumed = i;
                    break;
                }
                match parse_frame(&data[i..i + full_len]) {
                    Ok(frame) => {
                        debug!(
                            "frame: notify={} mid={:02X}.{:02X} payload={} bytes",
                            frame.notify,
                            frame.category,
                            frame.code,
                            frame.payload.len()
                        );
                        frames.push(frame);
                        i += full_len;
                        consumed = i;
                    }
                    Err(e) => {
                        warn!("dropping corrupt frame candidate at offset {i}: {e}");
                        i += 1;
                        consumed = i;
                    }
                }
            }
        }
    }

    if i >= data.len() {
        consumed = data.len();
    }
    (frames, consumed)
}
