use log::{info, warn};
use rusb::{Device, GlobalContext};
use std::time::Duration;

use super::{HidTransport, ProtocolAdapter, WebUsbTransport};
use crate::error::TransportError;
use crate::identity::{FriendlyUsbDevice, KEEPKEY_VID};

const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

type Opener = fn(&FriendlyUsbDevice) -> Result<Box<dyn ProtocolAdapter + Send>, TransportError>;

/// Opens the one long-lived link a device worker owns.
pub trait TransportFactory: Send + Sync {
    fn open(&self, device: &FriendlyUsbDevice) -> Result<Box<dyn ProtocolAdapter + Send>, TransportError>;
}

/// Real hardware: WebUSB first, HID as fallback. Legacy PID 0x0001 devices
/// have no WebUSB interface and go to HID first.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsbHidTransportFactory;

impl UsbHidTransportFactory {
    pub fn new() -> Self {
        Self
    }

    fn open_webusb(device: &FriendlyUsbDevice) -> Result<Box<dyn ProtocolAdapter + Send>, TransportError> {
        let physical = find_physical_device(device)?;
        let transport = WebUsbTransport::open(&physical, 0)?;
        info!("✅ Created WebUSB transport for device {}", device.unique_id);
        Ok(Box::new(transport))
    }

    fn open_hid(device: &FriendlyUsbDevice) -> Result<Box<dyn ProtocolAdapter + Send>, TransportError> {
        let transport = HidTransport::open(device)?;
        info!("✅ Created HID transport for device {}", device.unique_id);
        Ok(Box::new(transport))
    }
}

impl TransportFactory for UsbHidTransportFactory {
    fn open(&self, device: &FriendlyUsbDevice) -> Result<Box<dyn ProtocolAdapter + Send>, TransportError> {
        let (first, second): (Opener, Opener) = if device.is_legacy_hid() {
            (Self::open_hid, Self::open_webusb)
        } else {
            (Self::open_webusb, Self::open_hid)
        };

        match first(device) {
            Ok(transport) => Ok(transport),
            Err(first_err) => {
                warn!("⚠️ Primary transport failed for device {}: {}, trying fallback", device.unique_id, first_err);
                second(device).map_err(|second_err| {
                    warn!("Fallback transport failed for device {}: {}", device.unique_id, second_err);
                    match second_err {
                        TransportError::PermissionDenied(_) | TransportError::Busy(_) => second_err,
                        _ => first_err,
                    }
                })
            }
        }
    }
}

/// Locate the rusb device behind `target`, by bus/address first, then by serial.
pub fn find_physical_device(target: &FriendlyUsbDevice) -> Result<Device<GlobalContext>, TransportError> {
    let devices = rusb::devices()?;
    let keepkeys: Vec<Device<GlobalContext>> = devices
        .iter()
        .filter(|d| {
            d.device_descriptor()
                .map(|desc| desc.vendor_id() == KEEPKEY_VID && desc.product_id() == target.pid)
                .unwrap_or(false)
        })
        .collect();

    if let Some(device) = keepkeys
        .iter()
        .find(|d| d.bus_number() == target.bus && d.address() == target.address)
    {
        return Ok(device.clone());
    }

    if let Some(serial) = target.serial_number.as_deref().filter(|s| !s.trim().is_empty()) {
        for device in &keepkeys {
            if read_serial(device).as_deref() == Some(serial) {
                return Ok(device.clone());
            }
        }
    }

    Err(TransportError::NotFound(target.unique_id.to_string()))
}

/// Read the serial string descriptor, if the device lets us.
pub fn read_serial(device: &Device<GlobalContext>) -> Option<String> {
    let desc = device.device_descriptor().ok()?;
    let handle = device.open().ok()?;
    let lang = *handle.read_languages(SERIAL_READ_TIMEOUT).ok()?.first()?;
    handle.read_serial_number_string(lang, &desc, SERIAL_READ_TIMEOUT).ok()
}
