use serde::{Deserialize, Serialize};
use std::fmt;

/// Vendor ID for KeepKey devices
pub const KEEPKEY_VID: u16 = 0x2b24;
/// Older firmware and bootloaders enumerate as a plain HID device.
pub const KEEPKEY_LEGACY_PID: u16 = 0x0001;
/// Firmware 7.x and newer bootloaders enumerate with a WebUSB interface.
pub const KEEPKEY_WEBUSB_PID: u16 = 0x0002;

pub const KEEPKEY_PIDS: &[u16] = &[KEEPKEY_LEGACY_PID, KEEPKEY_WEBUSB_PID];

/// Stable key for a physical device.
///
/// The serial number is used when the OS reports one. Otherwise the key falls
/// back to `keepkey_{vid}_{pid}_bus{bus}_addr{addr}`, which is deterministic
/// for a given enumeration tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceIdentity(String);

const FALLBACK_PREFIX: &str = "keepkey_";

impl DeviceIdentity {
    pub fn derive(vid: u16, pid: u16, serial: Option<&str>, bus: u8, address: u8) -> Self {
        match serial.map(str::trim).filter(|s| !s.is_empty()) {
            Some(serial) => Self(serial.to_string()),
            None => Self(format!("{FALLBACK_PREFIX}{vid:04x}_{pid:04x}_bus{bus}_addr{address}")),
        }
    }

    /// True when the key was built from bus/address rather than a serial.
    pub fn is_fallback(&self) -> bool {
        self.0.starts_with(FALLBACK_PREFIX) && self.0.contains("_bus") && self.0.contains("_addr")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceIdentity {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for DeviceIdentity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// User-friendly representation of a USB device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FriendlyUsbDevice {
    pub unique_id: DeviceIdentity,
    pub name: String,
    pub vid: u16,
    pub pid: u16,
    pub bus: u8,
    pub address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub is_keepkey: bool,
}

impl FriendlyUsbDevice {
    /// Build from basic USB details.
    pub fn new(
        vid: u16,
        pid: u16,
        bus: u8,
        address: u8,
        manufacturer: Option<String>,
        product: Option<String>,
        serial_number: Option<String>,
    ) -> Self {
        let name = match (&product, &manufacturer) {
            (Some(p), Some(m)) => format!("{} - {}", m, p),
            (Some(p), None) => p.clone(),
            (None, Some(m)) => m.clone(),
            (None, None) => format!("USB Device (VID: {:04x}, PID: {:04x})", vid, pid),
        };
        Self {
            unique_id: DeviceIdentity::derive(vid, pid, serial_number.as_deref(), bus, address),
            name,
            vid,
            pid,
            bus,
            address,
            manufacturer,
            product,
            serial_number,
            is_keepkey: vid == KEEPKEY_VID && KEEPKEY_PIDS.contains(&pid),
        }
    }

    pub fn is_legacy_hid(&self) -> bool {
        self.pid == KEEPKEY_LEGACY_PID
    }

    /// Same physical port as `other`, regardless of what serial was reported.
    pub fn same_port(&self, other: &FriendlyUsbDevice) -> bool {
        self.bus == other.bus && self.address == other.address && self.vid == other.vid
    }
}
