//! EPC memory writes.
//!
//! The wire payload targets one antenna, the EPC bank and a word address,
//! optionally guarded by a match pattern (write only if the tag's current
//! EPC matches) and an access password. The reader answers with a result
//! code and, on partial failure, the word address where the write stopped.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::frame::{Frame, Mid};
use crate::reader::{build_antenna_mask, NationReader};
use crate::transport::RfidTransport;
use crate::types::{validate_epc_hex, ReaderError, WriteOutcome, WriteStatus};

/// Longest match pattern the single-byte bit-length field can describe
const MAX_MATCH_BYTES: usize = 31;

/// Window given to the post-write verification scan
const VERIFY_WINDOW: Duration = Duration::from_millis(1500);

/// Default deadline for the write exchange. Writing through the air takes
/// longer than an ordinary command round trip.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameters for a raw EPC bank write
#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
    /// 1-based antenna to write through
    pub antenna_id: u8,
    /// Word address in the EPC bank where the data lands
    pub start_word: u16,
    /// Data to write, hex encoded
    pub data_hex: &'a str,
    /// Only write if the tag's current EPC matches this hex value
    pub match_epc_hex: Option<&'a str>,
    /// 32-bit access password
    pub password: Option<u32>,
    /// Deadline for the write exchange, `None` for the 2 s default
    pub timeout: Option<Duration>,
}

/// Knobs for the scan-then-write flow
#[derive(Debug, Clone)]
pub struct TargetWriteOptions {
    /// How long to scan for the target tag before giving up
    pub scan_timeout: Duration,
    /// Deadline for the write exchange itself
    pub write_timeout: Duration,
    /// Re-read the tag after writing and report whether the new EPC shows up
    pub verify: bool,
    /// Write the PC word too (start at word 1) instead of starting after it
    pub overwrite_pc: bool,
    /// Extra words to skip before the data, for readers with reserved words
    pub prefix_words: u16,
    pub password: Option<u32>,
}

impl Default for TargetWriteOptions {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(2),
            write_timeout: WRITE_TIMEOUT,
            verify: true,
            overwrite_pc: true,
            prefix_words: 0,
            password: None,
        }
    }
}

/// Word address a write should start at for the given new EPC
pub fn calculate_start_word(
    epc_hex: &str,
    overwrite_pc: bool,
    prefix_words: u16,
) -> Result<u16, ReaderError> {
    validate_epc_hex(epc_hex)?;
    let base = if overwrite_pc { 1 } else { 2 };
    Ok(base + prefix_words)
}

/// PC word plus zero-padded EPC, as the hex string a full overwrite sends.
/// The PC's length field is the EPC's size in words, placed in bits 15-11.
fn pc_epc_hex(new_epc_hex: &str) -> String {
    let cleaned: String = new_epc_hex
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    let word_len = (cleaned.len() + 3) / 4;
    let pc = (word_len as u16) << 11;
    let mut full = format!("{pc:04X}");
    full.push_str(&cleaned);
    while full.len() < (word_len + 1) * 4 {
        full.push('0');
    }
    full
}

impl<T: RfidTransport + Send + 'static> NationReader<T> {
    /// Write raw data into the EPC bank of a tag in the field.
    ///
    /// A device-level rejection (locked bank, password error, tag lost) is
    /// reported in the returned [`WriteOutcome`], not as an `Err`.
    pub fn write_tag(&self, request: &WriteRequest<'_>) -> Result<WriteOutcome, ReaderError> {
        let data = validate_epc_hex(request.data_hex)?;

        if !self.stop_inventory()? {
            return Err(ReaderError::Protocol(
                "could not confirm the reader idle before writing".into(),
            ));
        }
        thread::sleep(Duration::from_millis(200));

        let mask = build_antenna_mask(&[request.antenna_id])?;
        let mut payload = Vec::with_capacity(9 + data.len());
        payload.extend_from_slice(&mask.to_be_bytes());
        payload.push(0x01); // EPC bank
        payload.extend_from_slice(&request.start_word.to_be_bytes());
        payload.extend_from_slice(&(data.len() as u16).to_be_bytes());
        payload.extend_from_slice(&data);

        if let Some(match_hex) = request.match_epc_hex {
            let match_bytes = validate_epc_hex(match_hex)?;
            if match_bytes.len() > MAX_MATCH_BYTES {
                return Err(ReaderError::InvalidParameter(format!(
                    "match pattern of {} bytes exceeds the {MAX_MATCH_BYTES}-byte limit",
                    match_bytes.len()
                )));
            }
            // Match content: area, start word, bit length, pattern bytes.
            let mut content = Vec::with_capacity(4 + match_bytes.len());
            content.push(0x01);
            content.extend_from_slice(&request.start_word.to_be_bytes());
            content.push((match_bytes.len() * 8) as u8);
            content.extend_from_slice(&match_bytes);

            payload.push(0x01); // match parameter
            payload.extend_from_slice(&(content.len() as u16).to_be_bytes());
            payload.extend_from_slice(&content);
        }

        if let Some(password) = request.password {
            payload.extend_from_slice(&[0x02, 0x00, 0x04]); // password parameter
            payload.extend_from_slice(&password.to_be_bytes());
        }

        let timeout = request.timeout.unwrap_or(WRITE_TIMEOUT);
        let frame = self.execute_deadline(Mid::WriteEpcTag, &payload, timeout)?;
        let outcome = parse_write_outcome(&frame)?;
        debug!("write result: {}", outcome.status.description());
        Ok(outcome)
    }

    /// Write a new EPC including a freshly computed PC word, starting at
    /// word 1. Callers pass only the EPC value; sizing and padding are
    /// handled here.
    pub fn write_tag_auto(
        &self,
        antenna_id: u8,
        new_epc_hex: &str,
        match_epc_hex: Option<&str>,
        password: Option<u32>,
    ) -> Result<WriteOutcome, ReaderError> {
        let full_hex = pc_epc_hex(new_epc_hex);
        self.write_tag(&WriteRequest {
            antenna_id,
            start_word: 1,
            data_hex: &full_hex,
            match_epc_hex,
            password,
            timeout: None,
        })
    }

    /// Scan for a tag currently reading `target_epc`, then rewrite its EPC
    /// to `new_epc_hex`, optionally verifying the result with a second scan.
    /// The inventory engine is always stopped before returning.
    pub fn write_to_target(
        &self,
        target_epc: &str,
        new_epc_hex: &str,
        options: &TargetWriteOptions,
    ) -> Result<WriteOutcome, ReaderError> {
        let result = self.write_to_target_inner(target_epc, new_epc_hex, options);
        if let Err(e) = self.stop_inventory() {
            warn!("failed to stop inventory after targeted write: {e}");
        }
        result
    }

    fn write_to_target_inner(
        &self,
        target_epc: &str,
        new_epc_hex: &str,
        options: &TargetWriteOptions,
    ) -> Result<WriteOutcome, ReaderError> {
        validate_epc_hex(target_epc)?;
        validate_epc_hex(new_epc_hex)?;

        if !self.scan_for_epc(target_epc, options.scan_timeout)? {
            debug!("target tag {target_epc} not seen within {:?}", options.scan_timeout);
            return Ok(WriteOutcome::of(WriteStatus::TargetNotFound));
        }
        self.stop_inventory()?;

        let start_word =
            calculate_start_word(new_epc_hex, options.overwrite_pc, options.prefix_words)?;
        let full_hex = pc_epc_hex(new_epc_hex);
        let mut outcome = self.write_tag(&WriteRequest {
            antenna_id: 1,
            start_word,
            data_hex: &full_hex,
            match_epc_hex: Some(target_epc),
            password: options.password,
            timeout: Some(options.write_timeout),
        })?;

        if options.verify && outcome.success() {
            let seen = self.scan_for_epc(new_epc_hex, VERIFY_WINDOW)?;
            outcome.verified = Some(seen);
            self.stop_inventory()?;
            if !seen {
                warn!("write reported success but the new EPC was not seen during verification");
            }
        }
        Ok(outcome)
    }

    /// Inventory briefly and report whether a tag with the given EPC is in
    /// the field. Useful as a pre-flight check before writing.
    pub fn check_write_epc(&self, epc_hex: &str) -> Result<bool, ReaderError> {
        validate_epc_hex(epc_hex)?;
        let found = self.scan_for_epc(epc_hex, Duration::from_secs(3))?;
        self.stop_inventory()?;
        Ok(found)
    }

    /// Run an inventory on antenna 1 until the wanted EPC shows up or the
    /// window elapses. Leaves the inventory running; callers stop it.
    fn scan_for_epc(&self, epc_hex: &str, window: Duration) -> Result<bool, ReaderError> {
        let wanted = epc_hex.to_uppercase();
        let (found_tx, found_rx) = mpsc::channel();
        self.start_inventory(&[1], move |tag| {
            if tag.epc == wanted {
                let _ = found_tx.send(());
            }
        })?;
        Ok(found_rx.recv_timeout(window).is_ok())
    }
}

fn parse_write_outcome(frame: &Frame) -> Result<WriteOutcome, ReaderError> {
    let code = frame
        .payload
        .first()
        .ok_or_else(|| ReaderError::Protocol("empty write reply".into()))?;
    let mut outcome = WriteOutcome::of(WriteStatus::from_code(*code));
    if frame.payload.len() >= 5 && frame.payload[1] == 0x01 && frame.payload[2] == 0x02 {
        outcome.failed_word = Some(u16::from_be_bytes([frame.payload[3], frame.payload[4]]));
    }
    Ok(outcome)
}
