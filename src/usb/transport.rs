//! Transport boundary: what the session layer needs from a physical link.
//!
//! One implementation speaks hidapi to real hardware; tests drive sessions
//! through a scripted mock. The session layer never touches hidapi
//! directly.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::profile::Profile;

use super::packet::{Packet, MSG_SIZE};

/// Transport-level failure classes.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("report I/O failed: {0}")]
    Io(String),
    #[error("device no longer present")]
    DeviceGone,
}

/// Direction of a hardware profile load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProfile {
    /// Push the in-memory profile down to the hardware.
    Restore,
    /// Read hardware state into the in-memory profile.
    Pull,
}

/// Firmware identity reported by a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FwInfo {
    /// Version in hundredths (125 = "1.25").
    pub version: u16,
    /// Reporting interval in milliseconds.
    pub poll_ms: u8,
}

/// Per-device report channel.
pub trait DeviceIo: Send {
    /// Transmit one outbound report.
    fn write(&mut self, packet: &Packet) -> Result<(), TransportError>;

    /// Query firmware version and poll rate.
    fn fw_info(&mut self) -> Result<FwInfo, TransportError>;

    /// Switch between software (RGB command) mode and hardware mode.
    fn set_active(&mut self, active: bool) -> Result<(), TransportError>;

    /// Toggle hardware playback on boards without RGB control.
    fn set_hw_mode(&mut self, enabled: bool) -> Result<(), TransportError>;

    /// Load profile state across the link in the given direction.
    fn load_profile(
        &mut self,
        profile: &mut Profile,
        mode: LoadProfile,
    ) -> Result<(), TransportError>;

    /// Push current indicator LED state. Best-effort.
    fn update_indicators(&mut self, force: bool);

    /// Push a full lighting re-sync for the current mode. Best-effort.
    fn update_rgb(&mut self, profile: &Profile);

    /// Transport-level reset.
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Release the underlying handle.
    fn close(&mut self);
}

// Vendor opcodes (byte 0) and sub-ops (byte 1).
const OP_MODE: u8 = 0x07;
const MODE_SET: u8 = 0x04;
const MODE_INDICATORS: u8 = 0x05;
const MODE_SELECT: u8 = 0x14;
const MODE_LEGACY: u8 = 0x40;
const SW_MODE: u8 = 0x02;
const HW_MODE: u8 = 0x01;
const OP_GET_INFO: u8 = 0x0e;
const INFO_FIRMWARE: u8 = 0x01;
const INFO_PROFILE: u8 = 0x02;
const OP_NAME: u8 = 0x16;

/// How many times a reset tries to reacquire the device before giving up.
const RESET_ATTEMPTS: u32 = 10;
const REOPEN_DELAY: Duration = Duration::from_millis(500);

/// hidapi-backed transport for the vendor control channel.
pub struct HidIo {
    api: Arc<Mutex<HidApi>>,
    device: Option<HidDevice>,
    vendor: u16,
    product: u16,
    serial: Option<String>,
}

impl HidIo {
    /// Open the control interface of a specific unit.
    pub fn open(
        api: &Arc<Mutex<HidApi>>,
        vendor: u16,
        product: u16,
        serial: Option<&str>,
    ) -> Result<Self, TransportError> {
        let device = {
            let api_guard = api.lock();
            let info = api_guard
                .device_list()
                .find(|d| {
                    d.vendor_id() == vendor
                        && d.product_id() == product
                        && (serial.is_none() || d.serial_number() == serial)
                })
                .ok_or(TransportError::DeviceGone)?;
            let device = info
                .open_device(&api_guard)
                .map_err(|err| TransportError::Io(err.to_string()))?;
            if let Err(err) = device.set_blocking_mode(false) {
                warn!("failed to set non-blocking mode: {}", err);
            }
            device
        };
        Ok(Self {
            api: Arc::clone(api),
            device: Some(device),
            vendor,
            product,
            serial: serial.map(str::to_owned),
        })
    }

    fn device(&self) -> Result<&HidDevice, TransportError> {
        self.device.as_ref().ok_or(TransportError::DeviceGone)
    }

    /// Send a vendor feature request and read back the response report.
    fn feature_exchange(&self, request: &[u8]) -> Result<[u8; MSG_SIZE + 1], TransportError> {
        let device = self.device()?;

        let mut out = [0u8; MSG_SIZE + 1];
        out[1..1 + request.len().min(MSG_SIZE)]
            .copy_from_slice(&request[..request.len().min(MSG_SIZE)]);
        device
            .send_feature_report(&out)
            .map_err(|err| TransportError::Io(err.to_string()))?;

        let mut response = [0u8; MSG_SIZE + 1];
        let read = device
            .get_feature_report(&mut response)
            .map_err(|err| TransportError::Io(err.to_string()))?;
        if read == 0 {
            return Err(TransportError::Io("empty feature response".into()));
        }
        Ok(response)
    }
}

impl DeviceIo for HidIo {
    fn write(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let device = self.device()?;

        #[cfg(any(target_os = "macos", target_os = "windows"))]
        let data = {
            let mut data = Vec::with_capacity(MSG_SIZE + 1);
            data.push(0x00); // Report ID
            data.extend_from_slice(packet.as_bytes());
            data
        };

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let data = packet.as_bytes().to_vec();

        device
            .write(&data)
            .map_err(|err| TransportError::Io(err.to_string()))?;
        Ok(())
    }

    fn fw_info(&mut self) -> Result<FwInfo, TransportError> {
        let response = self.feature_exchange(&[OP_GET_INFO, INFO_FIRMWARE])?;
        // Version little-endian at payload offset 8, poll interval at 10.
        let version = u16::from_le_bytes([response[9], response[10]]);
        let poll_ms = response[11].max(1);
        debug!("firmware {} reported, {} ms polling", version, poll_ms);
        Ok(FwInfo { version, poll_ms })
    }

    fn set_active(&mut self, active: bool) -> Result<(), TransportError> {
        let mut packet = Packet::with_opcode(OP_MODE);
        packet.set_payload(&[MODE_SET, if active { SW_MODE } else { HW_MODE }]);
        self.write(&packet)
    }

    fn set_hw_mode(&mut self, enabled: bool) -> Result<(), TransportError> {
        let mut packet = Packet::with_opcode(OP_MODE);
        packet.set_payload(&[MODE_LEGACY, u8::from(enabled)]);
        self.write(&packet)
    }

    fn load_profile(
        &mut self,
        profile: &mut Profile,
        mode: LoadProfile,
    ) -> Result<(), TransportError> {
        match mode {
            LoadProfile::Pull => {
                let response = self.feature_exchange(&[OP_GET_INFO, INFO_PROFILE])?;
                // Hardware profile name is a NUL-padded string at payload
                // offset 16.
                let raw = &response[17..33];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let name = String::from_utf8_lossy(&raw[..end]).trim().to_string();
                if !name.is_empty() {
                    profile.name = name;
                }
                profile.current = profile.ensure_mode(0);
                Ok(())
            }
            LoadProfile::Restore => {
                for (index, mode) in profile.modes.iter().enumerate() {
                    let mut packet = Packet::with_opcode(OP_NAME);
                    let mut payload = vec![index as u8];
                    payload.extend_from_slice(mode.name.as_bytes());
                    packet.set_payload(&payload);
                    self.write(&packet)?;
                }
                let mut select = Packet::with_opcode(OP_MODE);
                select.set_payload(&[MODE_SELECT, profile.current as u8]);
                self.write(&select)
            }
        }
    }

    fn update_indicators(&mut self, force: bool) {
        let mut packet = Packet::with_opcode(OP_MODE);
        packet.set_payload(&[MODE_INDICATORS, u8::from(force)]);
        if let Err(err) = self.write(&packet) {
            debug!("indicator update skipped: {}", err);
        }
    }

    fn update_rgb(&mut self, profile: &Profile) {
        let mut packet = Packet::with_opcode(OP_MODE);
        packet.set_payload(&[MODE_SELECT, profile.current as u8]);
        if let Err(err) = self.write(&packet) {
            debug!("lighting re-sync skipped: {}", err);
        }
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        // hidapi has no bus-level reset; drop the handle and reacquire the
        // unit by identity once the OS has re-enumerated it.
        self.device = None;
        for attempt in 1..=RESET_ATTEMPTS {
            thread::sleep(REOPEN_DELAY);
            let mut api_guard = self.api.lock();
            if let Err(err) = api_guard.refresh_devices() {
                debug!("device list refresh failed: {}", err);
                continue;
            }
            let found = api_guard.device_list().find(|d| {
                d.vendor_id() == self.vendor
                    && d.product_id() == self.product
                    && (self.serial.is_none() || d.serial_number() == self.serial.as_deref())
            });
            let Some(info) = found else { continue };
            match info.open_device(&api_guard) {
                Ok(device) => {
                    if let Err(err) = device.set_blocking_mode(false) {
                        warn!("failed to set non-blocking mode: {}", err);
                    }
                    self.device = Some(device);
                    debug!("reacquired device on attempt {}", attempt);
                    return Ok(());
                }
                Err(err) => debug!("reopen attempt {} failed: {}", attempt, err),
            }
        }
        Err(TransportError::DeviceGone)
    }

    fn close(&mut self) {
        self.device = None;
    }
}

/// Scripted transport for tests: every call is recorded and failures can
/// be injected per operation.
#[cfg(any(test, feature = "mock-hid"))]
pub mod mock {
    use super::*;

    #[derive(Default)]
    pub struct MockState {
        pub fw_version: u16,
        pub poll_ms: u8,
        /// Fail this many firmware queries before succeeding.
        pub fw_failures: usize,
        /// Fail this many resets before succeeding.
        pub reset_failures: usize,
        /// Fail this many profile loads before succeeding.
        pub load_failures: usize,
        /// Fail this many writes before succeeding.
        pub write_failures: usize,
        pub fw_queries: usize,
        pub resets: usize,
        pub written: Vec<Packet>,
        pub active_calls: Vec<bool>,
        pub hw_mode_calls: Vec<bool>,
        pub load_calls: Vec<LoadProfile>,
        pub indicator_calls: usize,
        pub rgb_syncs: usize,
        pub closed: bool,
    }

    #[derive(Clone, Default)]
    pub struct MockIo {
        pub state: Arc<Mutex<MockState>>,
    }

    impl MockIo {
        /// A mock reporting the given firmware version.
        pub fn with_fw(version: u16) -> Self {
            let mock = Self::default();
            {
                let mut state = mock.state.lock();
                state.fw_version = version;
                state.poll_ms = 1;
            }
            mock
        }
    }

    fn injected(counter: &mut usize, what: &str) -> Result<(), TransportError> {
        if *counter > 0 {
            *counter -= 1;
            return Err(TransportError::Io(format!("injected {} failure", what)));
        }
        Ok(())
    }

    impl DeviceIo for MockIo {
        fn write(&mut self, packet: &Packet) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            injected(&mut state.write_failures, "write")?;
            state.written.push(*packet);
            Ok(())
        }

        fn fw_info(&mut self) -> Result<FwInfo, TransportError> {
            let mut state = self.state.lock();
            state.fw_queries += 1;
            injected(&mut state.fw_failures, "firmware query")?;
            Ok(FwInfo {
                version: state.fw_version,
                poll_ms: state.poll_ms,
            })
        }

        fn set_active(&mut self, active: bool) -> Result<(), TransportError> {
            self.state.lock().active_calls.push(active);
            Ok(())
        }

        fn set_hw_mode(&mut self, enabled: bool) -> Result<(), TransportError> {
            self.state.lock().hw_mode_calls.push(enabled);
            Ok(())
        }

        fn load_profile(
            &mut self,
            profile: &mut Profile,
            mode: LoadProfile,
        ) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            state.load_calls.push(mode);
            injected(&mut state.load_failures, "profile load")?;
            if mode == LoadProfile::Pull {
                profile.current = profile.ensure_mode(0);
            }
            Ok(())
        }

        fn update_indicators(&mut self, _force: bool) {
            self.state.lock().indicator_calls += 1;
        }

        fn update_rgb(&mut self, _profile: &Profile) {
            self.state.lock().rgb_syncs += 1;
        }

        fn reset(&mut self) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            state.resets += 1;
            injected(&mut state.reset_failures, "reset")
        }

        fn close(&mut self) {
            self.state.lock().closed = true;
        }
    }
}
