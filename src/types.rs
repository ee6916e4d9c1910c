//! Data types shared across the driver

use std::ops::RangeInclusive;
use std::time::Duration;

use thiserror::Error;

use crate::frame::Mid;

/// Errors produced while communicating with the reader
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Transport layer failure (port not open, read/write I/O error)
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed frame surfaced outside the extraction loop
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// No matching response arrived before the deadline
    #[error("timed out waiting for response to {0:?}")]
    Timeout(Mid),
    /// Well-formed frame that does not fit the expected shape
    #[error("unexpected response: {0}")]
    Protocol(String),
    /// The reader rejected the command with a nonzero result code
    #[error("reader rejected command: {reason} (code 0x{code:02X})")]
    Device { code: u8, reason: &'static str },
    /// Invalid argument caught before any I/O
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// A previous inventory worker was abandoned and has not exited yet
    #[error("previous inventory worker has not exited")]
    WorkerBusy,
}

/// Frame-level decode failures. Recoverable during stream extraction:
/// the scanner logs and skips, it never raises.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes, need at least 9")]
    TooShort(usize),
    #[error("invalid frame header 0x{0:02X}")]
    BadHeader(u8),
    #[error("frame truncated")]
    Truncated,
    #[error("CRC mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    CrcMismatch { computed: u16, received: u16 },
}

/// Host-supplied limits and timing knobs.
///
/// The protocol-level ranges (antenna ids, Q, session) are fixed by the wire
/// format; everything a deployment may legitimately tune lives here.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Accepted transmit power range in dBm
    pub power_dbm: RangeInclusive<u8>,
    /// Deadline for a single command/response exchange
    pub response_timeout: Duration,
    /// Stop command attempts before giving up
    pub stop_attempts: u32,
    /// Pause between stop attempts
    pub stop_retry_delay: Duration,
    /// How long to wait for the inventory worker to exit on stop
    pub join_timeout: Duration,
    /// Capacity of the tag event queue between worker and dispatcher
    pub event_queue_depth: usize,
    /// Stop commands `is_idle` sends before reporting the reader busy
    pub idle_check_attempts: u32,
    /// Pause between idle checks
    pub idle_check_delay: Duration,
    /// Settle time granted to the hardware once the reader confirms idle
    pub idle_settle_delay: Duration,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            power_dbm: 0..=33,
            response_timeout: Duration::from_secs(1),
            stop_attempts: 10,
            stop_retry_delay: Duration::from_millis(200),
            join_timeout: Duration::from_secs(3),
            event_queue_depth: 64,
            idle_check_attempts: 3,
            idle_check_delay: Duration::from_millis(300),
            idle_settle_delay: Duration::from_millis(500),
        }
    }
}

/// A single tag detection reported during inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagRecord {
    /// EPC as an uppercase hex string
    pub epc: String,
    /// Protocol Control word of the tag (not the frame PCW)
    pub pc: u16,
    /// 1-based antenna port that saw the tag
    pub antenna_id: u8,
    /// Signal strength, present only when the reader appends the RSSI TLV
    pub rssi: Option<u8>,
}

impl TagRecord {
    /// Parse a tag payload: u16 EPC length, EPC bytes, u16 PC, antenna id,
    /// then optionally PID 0x01 followed by one RSSI byte.
    pub fn parse(data: &[u8]) -> Result<Self, ReaderError> {
        if data.len() < 2 {
            return Err(ReaderError::Protocol("tag payload too short for EPC length".into()));
        }
        let epc_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let pc_offset = 2 + epc_len;
        if pc_offset + 2 > data.len() {
            return Err(ReaderError::Protocol(format!(
                "tag payload truncated: EPC length {epc_len} does not fit"
            )));
        }
        let epc = bytes_to_hex(&data[2..pc_offset]);
        let pc = u16::from_be_bytes([data[pc_offset], data[pc_offset + 1]]);

        let ant_offset = pc_offset + 2;
        if ant_offset >= data.len() {
            return Err(ReaderError::Protocol("tag payload missing antenna id".into()));
        }
        let antenna_id = data[ant_offset];

        let mut rssi = None;
        if data.len() > ant_offset + 2 && data[ant_offset + 1] == 0x01 {
            rssi = Some(data[ant_offset + 2]);
        }

        Ok(Self { epc, pc, antenna_id, rssi })
    }
}

/// Why an inventory session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Single-shot read finished on its own
    Completed,
    /// The stop command took effect
    StoppedByCommand,
    /// The reader aborted on a hardware fault
    HardwareError,
    /// Reason byte outside the documented set
    Other(u8),
}

impl EndReason {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => EndReason::Completed,
            1 => EndReason::StoppedByCommand,
            2 => EndReason::HardwareError,
            other => EndReason::Other(other),
        }
    }
}

/// Device result code of an EPC write attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Success,
    AntennaError,
    MatchError,
    ParameterError,
    CrcError,
    InsufficientPower,
    Overflow,
    Locked,
    PasswordError,
    TagError,
    TagLost,
    SendError,
    /// Scan-then-write flow: the target tag was never seen
    TargetNotFound,
    Unknown(u8),
}

impl WriteStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => WriteStatus::Success,
            0x01 => WriteStatus::AntennaError,
            0x02 => WriteStatus::MatchError,
            0x03 => WriteStatus::ParameterError,
            0x04 => WriteStatus::CrcError,
            0x05 => WriteStatus::InsufficientPower,
            0x06 => WriteStatus::Overflow,
            0x07 => WriteStatus::Locked,
            0x08 => WriteStatus::PasswordError,
            0x09 => WriteStatus::TagError,
            0x0A => WriteStatus::TagLost,
            0x0B => WriteStatus::SendError,
            other => WriteStatus::Unknown(other),
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            WriteStatus::Success => "write successful",
            WriteStatus::AntennaError => "antenna parameter error",
            WriteStatus::MatchError => "match parameter error",
            WriteStatus::ParameterError => "write parameter error",
            WriteStatus::CrcError => "CRC check error",
            WriteStatus::InsufficientPower => "insufficient tag power",
            WriteStatus::Overflow => "data area overflow",
            WriteStatus::Locked => "data area locked",
            WriteStatus::PasswordError => "password error",
            WriteStatus::TagError => "other tag error",
            WriteStatus::TagLost => "tag lost during operation",
            WriteStatus::SendError => "reader send error",
            WriteStatus::TargetNotFound => "target tag not found",
            WriteStatus::Unknown(_) => "unknown write result code",
        }
    }
}

/// Outcome of a write attempt. A device-level rejection is still an
/// `Ok(WriteOutcome)`; only transport/timeout/protocol failures are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub status: WriteStatus,
    /// Word address where the write failed, when the reader reports one
    pub failed_word: Option<u16>,
    /// Result of the optional post-write verification scan
    pub verified: Option<bool>,
}

impl WriteOutcome {
    pub(crate) fn of(status: WriteStatus) -> Self {
        Self { status, failed_word: None, verified: None }
    }

    pub fn success(&self) -> bool {
        self.status == WriteStatus::Success
    }
}

/// Baseband (RF/PHY) parameter set governing inventory behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasebandConfig {
    /// Link speed profile: 0..=4, or 255 for automatic
    pub speed: u8,
    /// Anti-collision Q value, 0..=15
    pub q_value: u8,
    /// Session S0..S3, 0..=3
    pub session: u8,
    /// Inventory flag, 0..=2
    pub inventory_flag: u8,
}

impl BasebandConfig {
    pub(crate) fn validate(&self) -> Result<(), ReaderError> {
        if !matches!(self.speed, 0..=4 | 255) {
            return Err(ReaderError::InvalidParameter(format!(
                "baseband speed must be 0-4 or 255, got {}",
                self.speed
            )));
        }
        if self.q_value > 15 {
            return Err(ReaderError::InvalidParameter(format!(
                "Q value must be 0-15, got {}",
                self.q_value
            )));
        }
        if self.session > 3 {
            return Err(ReaderError::InvalidParameter(format!(
                "session must be 0-3, got {}",
                self.session
            )));
        }
        if self.inventory_flag > 2 {
            return Err(ReaderError::InvalidParameter(format!(
                "inventory flag must be 0-2, got {}",
                self.inventory_flag
            )));
        }
        Ok(())
    }
}

/// Regional RF band plans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfBand {
    Cn920_925 = 0,
    Cn840_845 = 1,
    CnDual = 2,
    Fcc902_928 = 3,
    Etsi866_868 = 4,
    Japan = 5,
    Taiwan = 6,
    Indonesia = 7,
    Russia = 8,
}

impl RfBand {
    pub fn name(&self) -> &'static str {
        match self {
            RfBand::Cn920_925 => "CN 920-925 MHz",
            RfBand::Cn840_845 => "CN 840-845 MHz",
            RfBand::CnDual => "CN dual-band 840-845 + 920-925 MHz",
            RfBand::Fcc902_928 => "FCC 902-928 MHz",
            RfBand::Etsi866_868 => "ETSI 866-868 MHz",
            RfBand::Japan => "JP 916.8-920.4 MHz",
            RfBand::Taiwan => "TW 922.25-927.75 MHz",
            RfBand::Indonesia => "ID 923.125-925.125 MHz",
            RfBand::Russia => "RUS 866.6-867.4 MHz",
        }
    }
}

impl TryFrom<u8> for RfBand {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, u8> {
        match code {
            0 => Ok(RfBand::Cn920_925),
            1 => Ok(RfBand::Cn840_845),
            2 => Ok(RfBand::CnDual),
            3 => Ok(RfBand::Fcc902_928),
            4 => Ok(RfBand::Etsi866_868),
            5 => Ok(RfBand::Japan),
            6 => Ok(RfBand::Taiwan),
            7 => Ok(RfBand::Indonesia),
            8 => Ok(RfBand::Russia),
            other => Err(other),
        }
    }
}

/// Working frequency configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkingFrequency {
    /// Automatic frequency hopping
    Auto,
    /// Fixed channel list
    Manual(Vec<u8>),
}

/// Tag filter settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterSettings {
    /// Repeat-tag suppression time in 10 ms units
    pub repeat_time: u16,
    pub rssi_threshold: Option<u8>,
}

/// Buzzer behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuzzerMode {
    Off,
    Continuous,
    /// Beep only when the application reports a new tag; no immediate
    /// hardware command is sent for this mode.
    OnNewTag,
}

/// Reader identity and firmware details
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial_number: String,
    pub power_on_seconds: u32,
    pub baseband_compile_time: String,
    pub app_version: Option<String>,
    pub os_version: Option<String>,
    pub app_compile_time: Option<String>,
}

impl DeviceInfo {
    /// Parse the query-info payload: length-prefixed serial number (one tag
    /// byte precedes the length), u32 power-on seconds, length-prefixed
    /// baseband compile time, then a TLV stream of optional fields.
    pub fn parse(data: &[u8]) -> Result<Self, ReaderError> {
        let mut info = DeviceInfo::default();
        let mut offset = 0usize;

        let (sn, next) = read_prefixed_string(data, offset)
            .ok_or_else(|| ReaderError::Protocol("device info payload too short for serial number".into()))?;
        info.serial_number = sn;
        offset = next;

        if offset + 4 > data.len() {
            return Err(ReaderError::Protocol("device info payload missing power-on time".into()));
        }
        info.power_on_seconds =
            u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]]);
        offset += 4;

        let (bb, next) = read_prefixed_string(data, offset)
            .ok_or_else(|| ReaderError::Protocol("device info payload missing baseband compile time".into()))?;
        info.baseband_compile_time = bb;
        offset = next;

        while offset + 2 <= data.len() {
            let tag = data[offset];
            let len = data[offset + 1] as usize;
            if offset + 2 + len > data.len() {
                break;
            }
            let value = &data[offset + 2..offset + 2 + len];
            offset += 2 + len;

            match tag {
                0x01 if len == 4 => {
                    let v = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
                    info.app_version = Some(format!(
                        "V{}.{}.{}.{}",
                        (v >> 24) & 0xFF,
                        (v >> 16) & 0xFF,
                        (v >> 8) & 0xFF,
                        v & 0xFF
                    ));
                }
                0x02 => info.os_version = Some(ascii_trimmed(value)),
                0x03 => info.app_compile_time = Some(ascii_trimmed(value)),
                _ => {}
            }
        }

        Ok(info)
    }
}

/// Reader capability report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfidAbility {
    pub min_power_dbm: u8,
    pub max_power_dbm: u8,
    pub antenna_count: u8,
    pub frequency_codes: Vec<u8>,
    pub protocol_codes: Vec<u8>,
}

impl RfidAbility {
    /// Payload: max power, min power, antenna count, then optional
    /// length-prefixed frequency and protocol code lists.
    pub fn parse(data: &[u8]) -> Result<Self, ReaderError> {
        if data.len() < 3 {
            return Err(ReaderError::Protocol("ability payload shorter than 3 bytes".into()));
        }
        let mut ability = RfidAbility {
            max_power_dbm: data[0],
            min_power_dbm: data[1],
            antenna_count: data[2],
            frequency_codes: Vec::new(),
            protocol_codes: Vec::new(),
        };

        if data.len() > 3 {
            let freq_len = data[3] as usize;
            if 4 + freq_len <= data.len() {
                ability.frequency_codes = data[4..4 + freq_len].to_vec();
                let proto_offset = 4 + freq_len;
                if proto_offset < data.len() {
                    let proto_len = data[proto_offset] as usize;
                    if proto_offset + 1 + proto_len <= data.len() {
                        ability.protocol_codes =
                            data[proto_offset + 1..proto_offset + 1 + proto_len].to_vec();
                    }
                }
            }
        }

        Ok(ability)
    }
}

/// Aggregate configuration snapshot, rebuilt on demand by `query_profile`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderProfile {
    pub enabled_antennas: Vec<u8>,
    pub antenna_powers: Vec<(u8, u8)>,
    pub baseband: BasebandConfig,
    pub rf_band: Option<RfBand>,
    pub working_frequency: WorkingFrequency,
    pub filter: FilterSettings,
    pub device_info: DeviceInfo,
}

/// Convert bytes to an uppercase hex string
pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Validate an EPC hex string and convert it to word-aligned bytes.
/// Whitespace is stripped; the digit count must be even.
pub fn validate_epc_hex(epc_hex: &str) -> Result<Vec<u8>, ReaderError> {
    let cleaned: String = epc_hex.chars().filter(|c| !c.is_whitespace()).collect();
    if !cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ReaderError::InvalidParameter(format!(
            "EPC hex contains non-hex characters: {epc_hex:?}"
        )));
    }
    if cleaned.len() % 2 != 0 {
        return Err(ReaderError::InvalidParameter(format!(
            "EPC hex must have an even number of digits, got {}",
            cleaned.len()
        )));
    }
    let mut bytes = hex_to_bytes(&cleaned)?;
    if bytes.len() % 2 != 0 {
        bytes.push(0x00);
    }
    Ok(bytes)
}

pub(crate) fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, ReaderError> {
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| {
                ReaderError::InvalidParameter(format!("invalid hex byte {:?}", &hex[i..i + 2]))
            })
        })
        .collect()
}

fn read_prefixed_string(data: &[u8], offset: usize) -> Option<(String, usize)> {
    // One tag byte, one length byte, then the ASCII payload.
    if offset + 2 > data.len() {
        return None;
    }
    let len = data[offset + 1] as usize;
    if offset + 2 + len > data.len() {
        return None;
    }
    Some((ascii_trimmed(&data[offset + 2..offset + 2 + len]), offset + 2 + len))
}

fn ascii_trimmed(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
