//! Scripted in-process device for tests and demos.
//!
//! `MockTransport` speaks real v5/v4 packets: writes are reassembled and
//! decoded, replies are encoded and chunked, so the codec runs end to end.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{ProtocolAdapter, Transport, TransportFactory};
use crate::codec::{self, Reassembler, WireFormat, PACKET_SIZE};
use crate::error::TransportError;
use crate::identity::FriendlyUsbDevice;
use crate::messages::{Failure, FailureType, Features, Message, Success};

type Responder = Box<dyn FnMut(&Message) -> Vec<Message> + Send>;

struct DeviceState {
    responder: Responder,
    received: Vec<Message>,
    write_failures: VecDeque<TransportError>,
    open_failures: VecDeque<TransportError>,
    truncate_next: bool,
    corrupt_next: bool,
    response_delay: Duration,
    opens: usize,
    open_handles: usize,
    max_open_handles: usize,
    resets: usize,
    overlapping_requests: usize,
}

/// Shared handle on a scripted device. Clones observe the same device.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    /// `responder` maps each request to the messages the device sends back.
    /// An empty reply leaves the host waiting until its read times out.
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(&Message) -> Vec<Message> + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                responder: Box::new(responder),
                received: Vec::new(),
                write_failures: VecDeque::new(),
                open_failures: VecDeque::new(),
                truncate_next: false,
                corrupt_next: false,
                response_delay: Duration::ZERO,
                opens: 0,
                open_handles: 0,
                max_open_handles: 0,
                resets: 0,
                overlapping_requests: 0,
            })),
        }
    }

    /// An initialized, unlocked device on firmware 7.10.0.
    pub fn keepkey() -> Self {
        Self::new(|msg| match msg {
            Message::Initialize(_) | Message::GetFeatures(_) => vec![Self::features().into()],
            Message::Ping(ping) => vec![Success { message: ping.message.clone() }.into()],
            Message::ClearSession(_) => vec![Success::default().into()],
            Message::Cancel(_) => vec![Self::failure(FailureType::FailureActionCancelled, "Action cancelled by user")],
            _ => vec![Self::failure(FailureType::FailureUnexpectedMessage, "Unexpected message")],
        })
    }

    pub fn features() -> Features {
        Features {
            vendor: Some("keepkey.com".into()),
            major_version: Some(7),
            minor_version: Some(10),
            patch_version: Some(0),
            bootloader_mode: Some(false),
            device_id: Some("MOCKDEVICE0001".into()),
            label: Some("Mock KeepKey".into()),
            initialized: Some(true),
            pin_protection: Some(false),
            passphrase_protection: Some(false),
            model: Some("KeepKey".into()),
            ..Default::default()
        }
    }

    pub fn failure(code: FailureType, message: &str) -> Message {
        Failure { code: Some(code as i32), message: Some(message.into()) }.into()
    }

    /// Open a new link to this device, as a transport factory would.
    pub fn transport(&self, format: WireFormat) -> MockTransport {
        let mut state = self.lock();
        state.opens += 1;
        state.open_handles += 1;
        state.max_open_handles = state.max_open_handles.max(state.open_handles);
        drop(state);
        MockTransport {
            device: self.clone(),
            format,
            incoming: Reassembler::new(format),
            outgoing: VecDeque::new(),
        }
    }

    fn try_open(&self, format: WireFormat) -> Result<MockTransport, TransportError> {
        if let Some(err) = self.lock().open_failures.pop_front() {
            return Err(err);
        }
        Ok(self.transport(format))
    }

    /// Fail the next packet write with `err`.
    pub fn fail_next_write(&self, err: TransportError) {
        self.lock().write_failures.push_back(err);
    }

    pub fn fail_next_open(&self, err: TransportError) {
        self.lock().open_failures.push_back(err);
    }

    /// Drop the final packet of the next multi-packet reply.
    pub fn truncate_next_response(&self) {
        self.lock().truncate_next = true;
    }

    /// Damage the magic bytes of the next reply.
    pub fn corrupt_next_response(&self) {
        self.lock().corrupt_next = true;
    }

    /// Delay every packet read, simulating a slow device.
    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().response_delay = delay;
    }

    pub fn received(&self) -> Vec<Message> {
        self.lock().received.clone()
    }

    pub fn received_names(&self) -> Vec<&'static str> {
        self.lock().received.iter().map(Message::name).collect()
    }

    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn open_handles(&self) -> usize {
        self.lock().open_handles
    }

    /// Most links that were ever open at the same time.
    pub fn max_open_handles(&self) -> usize {
        self.lock().max_open_handles
    }

    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    /// Requests that arrived while a previous reply was still unread.
    pub fn overlapping_requests(&self) -> usize {
        self.lock().overlapping_requests
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct MockTransport {
    device: MockDevice,
    format: WireFormat,
    incoming: Reassembler,
    outgoing: VecDeque<[u8; PACKET_SIZE]>,
}

impl MockTransport {
    fn respond(&mut self, request: Message) {
        let mut state = self.device.lock();
        if !self.outgoing.is_empty() {
            state.overlapping_requests += 1;
        }
        state.received.push(request.clone());
        let replies = (state.responder)(&request);
        let truncate = std::mem::take(&mut state.truncate_next);
        let corrupt = std::mem::take(&mut state.corrupt_next);
        drop(state);

        for reply in replies {
            // Reads come back without the HID report ID, in both formats.
            let mut packets = match codec::encode(&reply.to_wire(), WireFormat::V5) {
                Ok(packets) => packets,
                Err(_) => continue,
            };
            if truncate && packets.len() > 1 {
                packets.pop();
            }
            if corrupt {
                packets[0][1] = b'!';
            }
            self.outgoing.extend(packets);
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let mut state = self.device.lock();
        state.open_handles = state.open_handles.saturating_sub(1);
    }
}

impl Transport for MockTransport {
    type Error = TransportError;

    fn wire_format(&self) -> WireFormat {
        self.format
    }

    fn write_packet(&mut self, packet: &[u8; PACKET_SIZE], _timeout: Duration) -> Result<(), Self::Error> {
        if let Some(err) = self.device.lock().write_failures.pop_front() {
            self.incoming.clear();
            return Err(err);
        }
        let frame = self
            .incoming
            .push(packet)
            .map_err(|e| TransportError::Other(format!("mock device rejected packet: {e}")))?;
        if let Some(frame) = frame {
            let request = Message::from_frame(&frame)
                .map_err(|e| TransportError::Other(format!("mock device could not decode request: {e}")))?;
            self.respond(request);
        }
        Ok(())
    }

    fn read_packet(&mut self, buf: &mut [u8; PACKET_SIZE], _timeout: Duration) -> Result<usize, Self::Error> {
        let delay = self.device.lock().response_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        match self.outgoing.pop_front() {
            Some(packet) => {
                buf.copy_from_slice(&packet);
                Ok(PACKET_SIZE)
            }
            None => Ok(0),
        }
    }

    fn reset(&mut self) -> Result<(), Self::Error> {
        self.device.lock().resets += 1;
        self.outgoing.clear();
        self.incoming.clear();
        Ok(())
    }
}

/// Transport factory handing out links to scripted devices.
#[derive(Clone)]
pub struct MockTransportFactory {
    format: WireFormat,
    default_device: Option<MockDevice>,
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
}

impl MockTransportFactory {
    /// Every device id opens `device`.
    pub fn single(device: MockDevice) -> Self {
        Self {
            format: WireFormat::V5,
            default_device: Some(device),
            devices: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Only devices registered with [`MockTransportFactory::insert`] can be opened.
    pub fn new() -> Self {
        Self {
            format: WireFormat::V5,
            default_device: None,
            devices: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_format(mut self, format: WireFormat) -> Self {
        self.format = format;
        self
    }

    pub fn insert(&self, device_id: impl Into<String>, device: MockDevice) {
        if let Ok(mut devices) = self.devices.lock() {
            devices.insert(device_id.into(), device);
        }
    }

    fn device_for(&self, device_id: &str) -> Option<MockDevice> {
        self.devices
            .lock()
            .ok()
            .and_then(|devices| devices.get(device_id).cloned())
            .or_else(|| self.default_device.clone())
    }
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for MockTransportFactory {
    fn open(&self, device: &FriendlyUsbDevice) -> Result<Box<dyn ProtocolAdapter + Send>, TransportError> {
        let mock = self
            .device_for(device.unique_id.as_str())
            .ok_or_else(|| TransportError::NotFound(device.unique_id.to_string()))?;
        Ok(Box::new(mock.try_open(self.format)?))
    }
}

/// A friendly descriptor for a mock device with the given serial.
pub fn mock_usb_device(serial: &str) -> FriendlyUsbDevice {
    FriendlyUsbDevice::new(
        crate::identity::KEEPKEY_VID,
        crate::identity::KEEPKEY_WEBUSB_PID,
        1,
        serial.bytes().fold(2u8, |acc, b| acc.wrapping_add(b)),
        Some("KeepKey".into()),
        Some("KeepKey".into()),
        Some(serial.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{GetFeatures, Ping};

    #[test]
    fn v4_link_round_trips_through_packets() {
        let device = MockDevice::keepkey();
        let mut link = device.transport(WireFormat::V4);
        let reply = link.handle(GetFeatures {}.into()).unwrap();
        assert!(matches!(reply, Message::Features(f) if f.major_version == Some(7)));
    }

    #[test]
    fn tracks_open_handles() {
        let device = MockDevice::keepkey();
        let first = device.transport(WireFormat::V5);
        let second = device.transport(WireFormat::V5);
        assert_eq!(device.open_handles(), 2);
        drop(first);
        drop(second);
        assert_eq!(device.open_handles(), 0);
        assert_eq!(device.max_open_handles(), 2);
        assert_eq!(device.opens(), 2);
    }

    #[test]
    fn injected_write_failure_is_reported_once() {
        let device = MockDevice::keepkey();
        device.fail_next_write(TransportError::Disconnected("unplugged".into()));
        let mut link = device.transport(WireFormat::V5);
        let ping = Message::from(Ping { message: Some("hi".into()), ..Default::default() });
        assert!(link.handle(ping.clone()).is_err());
        assert!(matches!(link.handle(ping).unwrap(), Message::Success(_)));
    }
}
