use hidapi::{HidApi, HidDevice};
use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use super::Transport;
use crate::codec::{WireFormat, PACKET_SIZE};
use crate::error::TransportError;
use crate::identity::{FriendlyUsbDevice, KEEPKEY_VID};

const FLUSH_TIMEOUT_MS: i32 = 10;
const MAX_FLUSH_PACKETS: usize = 64;

#[derive(Debug, Error)]
pub enum HidError {
    #[error("HID API error: {0}")]
    HidApi(#[from] hidapi::HidError),
    #[error("no KeepKey HID device found for {0}")]
    NotFound(String),
    #[error("HID write incomplete: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
    #[error("HID API lock poisoned")]
    Poisoned,
}

impl From<HidError> for TransportError {
    fn from(err: HidError) -> Self {
        match err {
            HidError::HidApi(e) => TransportError::from_message(e.to_string()),
            HidError::NotFound(id) => TransportError::NotFound(id),
            other => TransportError::Other(other.to_string()),
        }
    }
}

/// One hidapi context per process; hidapi keeps global state and does not
/// tolerate several contexts enumerating at once.
static HID_API: OnceCell<Mutex<HidApi>> = OnceCell::new();

fn hid_api() -> Result<&'static Mutex<HidApi>, HidError> {
    HID_API.get_or_try_init(|| HidApi::new().map(Mutex::new).map_err(HidError::from))
}

/// HID transport for legacy KeepKey devices (PID 0x0001) and as a fallback
/// when the WebUSB interface cannot be claimed. Speaks v4 framing.
pub struct HidTransport {
    device: HidDevice,
    legacy: bool,
}

impl HidTransport {
    /// Open the HID interface for `target`.
    ///
    /// The exact serial match is tried first. If it is missing or cannot be
    /// opened, the first enumerated device with the same VID/PID is opened.
    /// Both attempts are logged.
    pub fn open(target: &FriendlyUsbDevice) -> Result<Self, HidError> {
        let mut api = hid_api()?.lock().map_err(|_| HidError::Poisoned)?;
        api.refresh_devices()?;

        let candidates: Vec<hidapi::DeviceInfo> = api
            .device_list()
            .filter(|info| info.vendor_id() == KEEPKEY_VID && info.product_id() == target.pid)
            .cloned()
            .collect();

        debug!("HID: {} candidate(s) for {:04x}:{:04x}", candidates.len(), KEEPKEY_VID, target.pid);
        if candidates.is_empty() {
            return Err(HidError::NotFound(target.unique_id.to_string()));
        }

        let serial = target.serial_number.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if let Some(serial) = serial {
            match candidates.iter().find(|info| info.serial_number() == Some(serial)) {
                Some(info) => {
                    info!("HID: opening {} by exact serial match", serial);
                    match info.open_device(&api) {
                        Ok(device) => return Ok(Self::new(device, target)),
                        Err(e) => warn!("HID: exact serial open failed for {}: {}", serial, e),
                    }
                }
                None => warn!("HID: no enumerated device reports serial {}", serial),
            }
        }

        let fallback = &candidates[0];
        info!(
            "HID: falling back to first {:04x}:{:04x} device (serial {:?}, path {})",
            fallback.vendor_id(),
            fallback.product_id(),
            fallback.serial_number(),
            fallback.path().to_string_lossy()
        );
        match fallback.open_device(&api) {
            Ok(device) => Ok(Self::new(device, target)),
            Err(e) => {
                warn!("HID: fallback open failed for {}: {}", target.unique_id, e);
                Err(e.into())
            }
        }
    }

    fn new(device: HidDevice, target: &FriendlyUsbDevice) -> Self {
        Self { device, legacy: target.is_legacy_hid() }
    }
}

impl Transport for HidTransport {
    type Error = HidError;

    fn wire_format(&self) -> WireFormat {
        WireFormat::V4
    }

    fn legacy_timing(&self) -> bool {
        self.legacy
    }

    fn write_packet(&mut self, packet: &[u8; PACKET_SIZE], _timeout: Duration) -> Result<(), Self::Error> {
        let written = self.device.write(packet)?;
        if written < packet.len() - 1 {
            return Err(HidError::ShortWrite { written, expected: packet.len() });
        }
        Ok(())
    }

    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE], timeout: Duration) -> Result<usize, Self::Error> {
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        Ok(self.device.read_timeout(buf, timeout_ms)?)
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        let mut dummy = [0u8; PACKET_SIZE];
        let mut packets_flushed = 0;
        while packets_flushed < MAX_FLUSH_PACKETS {
            if self.device.read_timeout(&mut dummy, FLUSH_TIMEOUT_MS)? == 0 {
                break;
            }
            packets_flushed += 1;
        }
        if packets_flushed > 0 {
            info!("HID Reset: Flushed {} packets from device buffer", packets_flushed);
        }
        Ok(())
    }
}
