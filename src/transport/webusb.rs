use super::Transport;
use crate::codec::{WireFormat, PACKET_SIZE};
use core::time::Duration;
use log::{debug, info, warn};
use rusb::{Device, DeviceHandle, UsbContext};

const FLUSH_TIMEOUT: Duration = Duration::from_millis(10);
const MAX_FLUSH_PACKETS: usize = 64;

/// WebUSB transport for KeepKey devices enumerating with PID 0x0002.
/// Uses the bulk endpoint pair of the vendor interface and v5 framing.
pub struct WebUsbTransport<T: UsbContext> {
    handle: DeviceHandle<T>,
    interface_number: u8,
    in_endpoint_address: u8,
    out_endpoint_address: u8,
}

impl<T: UsbContext> WebUsbTransport<T> {
    /// Open and claim `interface_index`.
    ///
    /// The device is not reset after opening: a USB reset makes the OS
    /// re-enumerate the device, which shows up as a disconnect/reconnect.
    pub fn open(device: &Device<T>, interface_index: usize) -> Result<Self, rusb::Error> {
        let config_descriptor = device.active_config_descriptor()?;
        let mut handle = device.open()?;

        match handle.set_auto_detach_kernel_driver(true) {
            Err(rusb::Error::NotSupported) => Ok(()),
            x => x,
        }?;

        let interface = config_descriptor
            .interfaces()
            .nth(interface_index)
            .ok_or(rusb::Error::NotFound)?;
        let interface_number = interface.number();
        handle.claim_interface(interface_number)?;

        let interface_descriptor = interface.descriptors().next().ok_or(rusb::Error::NotFound)?;
        handle.set_alternate_setting(interface_number, 0)?;

        let mut in_endpoint = None;
        let mut out_endpoint = None;
        for endpoint in interface_descriptor.endpoint_descriptors() {
            debug!(
                "WebUSB: endpoint 0x{:02x} type={:?} dir={:?} max_packet={}",
                endpoint.address(),
                endpoint.transfer_type(),
                endpoint.direction(),
                endpoint.max_packet_size()
            );
            if endpoint.transfer_type() != rusb::TransferType::Bulk {
                continue;
            }
            match endpoint.direction() {
                rusb::Direction::In if in_endpoint.is_none() => in_endpoint = Some(endpoint.address()),
                rusb::Direction::Out if out_endpoint.is_none() => out_endpoint = Some(endpoint.address()),
                _ => {}
            }
        }

        let (Some(in_endpoint_address), Some(out_endpoint_address)) = (in_endpoint, out_endpoint) else {
            warn!("WebUSB: interface {} has no bulk endpoint pair", interface_number);
            let _ = handle.release_interface(interface_number);
            return Err(rusb::Error::InvalidParam);
        };

        info!(
            "WebUSB: claimed interface {} (IN 0x{:02x}, OUT 0x{:02x}) on bus {} addr {}",
            interface_number,
            in_endpoint_address,
            out_endpoint_address,
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            handle,
            interface_number,
            in_endpoint_address,
            out_endpoint_address,
        })
    }
}

impl<T: UsbContext> Drop for WebUsbTransport<T> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface_number) {
            debug!("WebUSB: release_interface({}) failed: {}", self.interface_number, e);
        }
    }
}

impl<T: UsbContext> Transport for WebUsbTransport<T> {
    type Error = rusb::Error;

    fn wire_format(&self) -> WireFormat {
        WireFormat::V5
    }

    fn write_packet(&mut self, packet: &[u8; PACKET_SIZE], timeout: Duration) -> Result<(), Self::Error> {
        let written = self.handle.write_bulk(self.out_endpoint_address, packet, timeout)?;
        if written != packet.len() {
            return Err(rusb::Error::Io);
        }
        Ok(())
    }

    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE], timeout: Duration) -> Result<usize, Self::Error> {
        match self.handle.read_bulk(self.in_endpoint_address, buf, timeout) {
            Err(rusb::Error::Timeout) => Ok(0),
            other => other,
        }
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        let mut buf = [0u8; PACKET_SIZE];
        for _ in 0..MAX_FLUSH_PACKETS {
            match self.handle.read_bulk(self.in_endpoint_address, &mut buf, FLUSH_TIMEOUT) {
                Ok(0) | Err(rusb::Error::Timeout) => return Ok(()),
                Ok(_) | Err(rusb::Error::Overflow) => debug!("WebUSB: flushed stale packet"),
                Err(x) => return Err(x),
            }
        }
        Ok(())
    }
}
