//! Command engine and device configuration.
//!
//! All commands share one transport behind a mutex, so configuration calls
//! and the inventory worker can coexist on the same serial line. A command
//! holds the lock for its whole exchange; the worker locks per read.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::debug;

use crate::frame::{
    build_frame, device_error_reason, extract_valid_frames, Frame, Mid, GENERIC_ERROR_CODE,
};
use crate::inventory::InventoryHandle;
use crate::transport::RfidTransport;
use crate::types::{
    BasebandConfig, BuzzerMode, DeviceInfo, FilterSettings, ReaderConfig, ReaderError,
    ReaderProfile, RfBand, RfidAbility, WorkingFrequency,
};

/// Bytes requested per transport read
pub(crate) const READ_CHUNK: usize = 128;
/// Per-read wait inside the response loop
const READ_SLICE_MS: u32 = 50;

/// Driver for a single reader on one transport.
pub struct NationReader<T: RfidTransport> {
    transport: Arc<Mutex<T>>,
    rs485_address: Option<u8>,
    config: ReaderConfig,
    buzzer_mode: BuzzerMode,
    pub(crate) inventory: InventoryHandle,
}

impl<T: RfidTransport> NationReader<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ReaderConfig::default())
    }

    pub fn with_config(transport: T, config: ReaderConfig) -> Self {
        Self {
            transport: Arc::new(Mutex::new(transport)),
            rs485_address: None,
            config,
            buzzer_mode: BuzzerMode::Off,
            inventory: InventoryHandle::new(),
        }
    }

    /// Address frames to a specific device on a shared RS-485 bus.
    /// `None` returns to point-to-point framing.
    pub fn set_rs485_address(&mut self, address: Option<u8>) {
        self.rs485_address = address;
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> Arc<Mutex<T>> {
        Arc::clone(&self.transport)
    }

    pub(crate) fn rs485_address(&self) -> Option<u8> {
        self.rs485_address
    }

    pub(crate) fn lock_transport(&self) -> Result<MutexGuard<'_, T>, ReaderError> {
        self.transport
            .lock()
            .map_err(|_| ReaderError::Transport("transport mutex poisoned".into()))
    }

    pub(crate) fn transport_err(e: T::Error) -> ReaderError {
        ReaderError::Transport(format!("{:?}", e))
    }

    /// Send a command and wait for the frame that answers it.
    pub(crate) fn execute(&self, mid: Mid, payload: &[u8]) -> Result<Frame, ReaderError> {
        self.execute_matching(mid, payload, |f| f.answers(mid))
    }

    /// Like [`execute`](Self::execute) with a caller-supplied deadline, for
    /// exchanges slower than an ordinary command round trip.
    pub(crate) fn execute_deadline(
        &self,
        mid: Mid,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Frame, ReaderError> {
        self.execute_matching_deadline(mid, payload, timeout, |f| f.answers(mid))
    }

    pub(crate) fn execute_matching<F>(
        &self,
        mid: Mid,
        payload: &[u8],
        matches: F,
    ) -> Result<Frame, ReaderError>
    where
        F: Fn(&Frame) -> bool,
    {
        self.execute_matching_deadline(mid, payload, self.config.response_timeout, matches)
    }

    /// Send a command and wait for the first frame accepted by `matches`.
    ///
    /// Unrelated frames (stray notifications, responses to earlier commands)
    /// are ignored. A generic rejection frame aborts the wait early.
    pub(crate) fn execute_matching_deadline<F>(
        &self,
        mid: Mid,
        payload: &[u8],
        timeout: Duration,
        matches: F,
    ) -> Result<Frame, ReaderError>
    where
        F: Fn(&Frame) -> bool,
    {
        let request = build_frame(mid, payload, self.rs485_address, false);
        let mut port = self.lock_transport()?;
        port.flush_input().map_err(Self::transport_err)?;
        port.write(&request).map_err(Self::transport_err)?;
        debug!("sent {:?} ({} payload bytes)", mid, payload.len());

        let deadline = Instant::now() + timeout;
        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = port.read(&mut chunk, READ_SLICE_MS).map_err(Self::transport_err)?;
            if n > 0 {
                buffer.extend_from_slice(&chunk[..n]);
                let (frames, consumed) = extract_valid_frames(&buffer);
                buffer.drain(..consumed);
                for frame in frames {
                    if matches(&frame) {
                        return Ok(frame);
                    }
                    if !frame.notify
                        && frame.code == GENERIC_ERROR_CODE
                        && mid.code() != GENERIC_ERROR_CODE
                        && frame.payload.len() == 1
                    {
                        let code = frame.payload[0];
                        return Err(ReaderError::Device { code, reason: device_error_reason(code) });
                    }
                    debug!(
                        "ignoring frame {:02X}.{:02X} while waiting for {:?}",
                        frame.category, frame.code, mid
                    );
                }
            }
            if Instant::now() >= deadline {
                return Err(ReaderError::Timeout(mid));
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity and capabilities
    // ------------------------------------------------------------------

    pub fn query_device_info(&self) -> Result<DeviceInfo, ReaderError> {
        let frame = self.execute(Mid::QueryInfo, &[])?;
        DeviceInfo::parse(&frame.payload)
    }

    pub fn query_ability(&self) -> Result<RfidAbility, ReaderError> {
        let frame = self.execute(Mid::QueryRfidAbility, &[])?;
        RfidAbility::parse(&frame.payload)
    }

    // ------------------------------------------------------------------
    // Power and antennas
    // ------------------------------------------------------------------

    /// Per-antenna transmit power as (antenna id, dBm) pairs.
    pub fn query_power(&self) -> Result<Vec<(u8, u8)>, ReaderError> {
        let frame = self.execute(Mid::QueryPower, &[])?;
        if frame.payload.len() % 2 != 0 {
            return Err(ReaderError::Protocol(format!(
                "power payload has odd length {}",
                frame.payload.len()
            )));
        }
        Ok(frame.payload.chunks_exact(2).map(|p| (p[0], p[1])).collect())
    }

    /// Set transmit power for the given antennas. `persist` of `Some(true)`
    /// survives a power cycle, `Some(false)` is explicitly temporary, `None`
    /// leaves the choice to the reader.
    pub fn configure_power(
        &self,
        antenna_powers: &[(u8, u8)],
        persist: Option<bool>,
    ) -> Result<(), ReaderError> {
        if antenna_powers.is_empty() {
            return Err(ReaderError::InvalidParameter("no antenna powers given".into()));
        }
        let mut payload = Vec::with_capacity(antenna_powers.len() * 2 + 2);
        for &(ant_id, dbm) in antenna_powers {
            if !(1..=64).contains(&ant_id) {
                return Err(ReaderError::InvalidParameter(format!(
                    "antenna id {ant_id} out of range 1-64"
                )));
            }
            if !self.config.power_dbm.contains(&dbm) {
                return Err(ReaderError::InvalidParameter(format!(
                    "power {dbm} dBm out of range {}-{} for antenna {ant_id}",
                    self.config.power_dbm.start(),
                    self.config.power_dbm.end()
                )));
            }
            payload.push(ant_id);
            payload.push(dbm);
        }
        if let Some(save) = persist {
            payload.push(0xFF);
            payload.push(save as u8);
        }

        let frame = self.execute(Mid::ConfigurePower, &payload)?;
        expect_result_code(&frame, power_error_reason)
    }

    /// The reader's 32-bit enabled-antenna mask. The reply to the power
    /// query carries the mask in its first four bytes.
    pub fn query_antenna_mask(&self) -> Result<u32, ReaderError> {
        let frame = self.execute(Mid::QueryPower, &[])?;
        if frame.payload.len() < 2 {
            return Err(ReaderError::Protocol("antenna mask payload shorter than 2 bytes".into()));
        }
        let mut mask = [0u8; 4];
        for (dst, src) in mask.iter_mut().zip(frame.payload.iter()) {
            *dst = *src;
        }
        Ok(u32::from_be_bytes(mask))
    }

    /// 1-based ids of the currently enabled antennas.
    pub fn enabled_antennas(&self) -> Result<Vec<u8>, ReaderError> {
        let mask = self.query_antenna_mask()?;
        Ok((1..=32).filter(|i| mask >> (i - 1) & 1 == 1).collect())
    }

    pub fn enable_antenna(&self, ant_id: u8, save: bool) -> Result<(), ReaderError> {
        let bit = antenna_bit(ant_id)?;
        let mask = self.query_antenna_mask()? | bit;
        self.write_antenna_mask(mask, save)
    }

    pub fn disable_antenna(&self, ant_id: u8, save: bool) -> Result<(), ReaderError> {
        let bit = antenna_bit(ant_id)?;
        let mask = self.query_antenna_mask()? & !bit;
        self.write_antenna_mask(mask, save)
    }

    fn write_antenna_mask(&self, mask: u32, save: bool) -> Result<(), ReaderError> {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&mask.to_be_bytes());
        payload.push(0xFF);
        payload.push(save as u8);
        let frame = self.execute(Mid::ConfigureAntennas, &payload)?;
        expect_result_code(&frame, |_| "antenna configuration rejected")
    }

    // ------------------------------------------------------------------
    // Filtering, profiles and the buzzer
    // ------------------------------------------------------------------

    pub fn query_filter(&self) -> Result<FilterSettings, ReaderError> {
        let frame = self.execute(Mid::QueryFilter, &[])?;
        if frame.payload.len() < 2 {
            return Err(ReaderError::Protocol("filter payload shorter than 2 bytes".into()));
        }
        Ok(FilterSettings {
            repeat_time: u16::from_be_bytes([frame.payload[0], frame.payload[1]]),
            rssi_threshold: frame.payload.get(2).copied(),
        })
    }

    pub fn set_filter(&self, settings: &FilterSettings) -> Result<(), ReaderError> {
        let mut payload = Vec::with_capacity(3);
        payload.extend_from_slice(&settings.repeat_time.to_be_bytes());
        if let Some(rssi) = settings.rssi_threshold {
            payload.push(rssi);
        }
        let frame = self.execute(Mid::SetFilter, &payload)?;
        expect_result_code(&frame, |_| "filter settings rejected")
    }

    /// Select a stored baseband profile (0, 1 or 2). The reader echoes the
    /// selected id back.
    pub fn select_profile(&self, profile_id: u8) -> Result<(), ReaderError> {
        if profile_id > 2 {
            return Err(ReaderError::InvalidParameter(format!(
                "profile id {profile_id} out of range 0-2"
            )));
        }
        let frame = self.execute(Mid::SelectProfile, &[profile_id])?;
        match frame.payload.first() {
            Some(&id) if id == profile_id => Ok(()),
            Some(&id) => Err(ReaderError::Protocol(format!(
                "profile selection echoed id {id}, requested {profile_id}"
            ))),
            None => Err(ReaderError::Protocol("empty profile selection reply".into())),
        }
    }

    /// `OnNewTag` arms the application-driven beep without touching the
    /// hardware; the other modes command the buzzer immediately.
    pub fn set_buzzer(&mut self, mode: BuzzerMode) -> Result<(), ReaderError> {
        match mode {
            BuzzerMode::Off => self.send_buzzer_command(0, 0)?,
            BuzzerMode::Continuous => self.send_buzzer_command(1, 1)?,
            BuzzerMode::OnNewTag => {}
        }
        self.buzzer_mode = mode;
        Ok(())
    }

    pub fn buzzer_enabled(&self) -> bool {
        !matches!(self.buzzer_mode, BuzzerMode::Off)
    }

    fn send_buzzer_command(&self, ring: u8, duration: u8) -> Result<(), ReaderError> {
        let frame = self.execute(Mid::BuzzerSwitch, &[ring, duration])?;
        expect_result_code(&frame, |_| "buzzer command rejected")
    }

    // ------------------------------------------------------------------
    // Frequency plan
    // ------------------------------------------------------------------

    pub fn query_rf_band(&self) -> Result<RfBand, ReaderError> {
        let frame = self.execute(Mid::QueryRfBand, &[])?;
        let code = frame
            .payload
            .first()
            .ok_or_else(|| ReaderError::Protocol("empty RF band reply".into()))?;
        RfBand::try_from(*code)
            .map_err(|c| ReaderError::Protocol(format!("unknown RF band code {c}")))
    }

    pub fn query_working_frequency(&self) -> Result<WorkingFrequency, ReaderError> {
        let frame = self.execute(Mid::QueryWorkingFrequency, &[])?;
        match frame.payload.split_first() {
            Some((0x00, _)) => Ok(WorkingFrequency::Auto),
            Some((0x01, channels)) => Ok(WorkingFrequency::Manual(channels.to_vec())),
            Some((mode, _)) => {
                Err(ReaderError::Protocol(format!("unknown frequency mode 0x{mode:02X}")))
            }
            None => Err(ReaderError::Protocol("empty working frequency reply".into())),
        }
    }
}

impl<T: RfidTransport + Send + 'static> NationReader<T> {
    /// Stop any running inventory and fetch the device identity. Meant as
    /// the first call after opening the transport.
    pub fn initialize(&self) -> Result<DeviceInfo, ReaderError> {
        self.stop_inventory()?;
        self.query_device_info()
    }

    pub fn query_baseband(&self) -> Result<BasebandConfig, ReaderError> {
        let frame = self.execute(Mid::QueryBaseband, &[])?;
        if frame.payload.len() < 4 {
            return Err(ReaderError::Protocol(format!(
                "baseband reply has {} bytes, expected 4",
                frame.payload.len()
            )));
        }
        Ok(BasebandConfig {
            speed: frame.payload[0],
            q_value: frame.payload[1],
            session: frame.payload[2],
            inventory_flag: frame.payload[3],
        })
    }

    /// Current inventory session (S0..S3), taken from the baseband state.
    pub fn query_session(&self) -> Result<u8, ReaderError> {
        let baseband = self.query_baseband()?;
        if baseband.session > 3 {
            return Err(ReaderError::Protocol(format!(
                "reader reported session {} outside S0-S3",
                baseband.session
            )));
        }
        Ok(baseband.session)
    }

    /// Apply a baseband parameter set. The reader must be idle, so any
    /// running inventory is stopped first.
    pub fn configure_baseband(&self, config: &BasebandConfig) -> Result<(), ReaderError> {
        config.validate()?;
        self.ensure_idle()?;

        let payload = [
            0x01, config.speed,
            0x02, config.q_value,
            0x03, config.session,
            0x04, config.inventory_flag,
        ];
        // Some firmware revisions answer under category 0x01 instead of 0x02.
        let frame = self.execute_matching(Mid::ConfigureBaseband, &payload, |f| {
            !f.notify && f.code == Mid::ConfigureBaseband.code() && matches!(f.category, 0x01 | 0x02)
        })?;
        expect_result_code(&frame, baseband_error_reason)
    }

    /// Switch the regional band plan. Requires an idle, settled reader.
    pub fn set_rf_band(&self, band: RfBand) -> Result<(), ReaderError> {
        self.ensure_idle()?;
        std::thread::sleep(Duration::from_millis(500));

        let frame = self.execute(Mid::SetRfBand, &[band as u8])?;
        expect_result_code(&frame, rf_band_error_reason)
    }

    /// Snapshot of the full reader configuration.
    pub fn query_profile(&self) -> Result<ReaderProfile, ReaderError> {
        Ok(ReaderProfile {
            enabled_antennas: self.enabled_antennas()?,
            antenna_powers: self.query_power()?,
            baseband: self.query_baseband()?,
            rf_band: self.query_rf_band().ok(),
            working_frequency: self.query_working_frequency()?,
            filter: self.query_filter()?,
            device_info: self.query_device_info()?,
        })
    }

    fn ensure_idle(&self) -> Result<(), ReaderError> {
        self.stop_inventory()?;
        if !self.is_idle() {
            return Err(ReaderError::Protocol("reader did not reach the idle state".into()));
        }
        Ok(())
    }
}

fn antenna_bit(ant_id: u8) -> Result<u32, ReaderError> {
    if !(1..=32).contains(&ant_id) {
        return Err(ReaderError::InvalidParameter(format!(
            "antenna id {ant_id} out of range 1-32"
        )));
    }
    Ok(1 << (ant_id - 1))
}

/// Convert 1-based antenna ids to the 32-bit wire mask.
pub(crate) fn build_antenna_mask(antenna_ids: &[u8]) -> Result<u32, ReaderError> {
    let mut mask = 0u32;
    for &id in antenna_ids {
        mask |= antenna_bit(id)?;
    }
    Ok(mask)
}

fn expect_result_code(
    frame: &Frame,
    reason: impl Fn(u8) -> &'static str,
) -> Result<(), ReaderError> {
    match frame.payload.first() {
        Some(0x00) => Ok(()),
        Some(&code) => Err(ReaderError::Device { code, reason: reason(code) }),
        None => Err(ReaderError::Protocol("empty result payload".into())),
    }
}

fn power_error_reason(code: u8) -> &'static str {
    match code {
        0x01 => "hardware does not support this antenna port",
        0x02 => "power level not supported",
        0x03 => "saving the configuration failed",
        _ => "unknown power configuration error",
    }
}

fn baseband_error_reason(code: u8) -> &'static str {
    match code {
        0x01 => "unsupported baseband parameter",
        0x02 => "Q parameter error",
        0x03 => "session parameter error",
        0x04 => "inventory flag parameter error",
        0x05 => "other parameter error",
        0x06 => "saving the configuration failed",
        _ => "unknown baseband configuration error",
    }
}

fn rf_band_error_reason(code: u8) -> &'static str {
    match code {
        0x01 => "frequency not supported by hardware",
        0x02 => "saving the configuration failed",
        _ => "unknown RF band error",
    }
}
