//! The single device watcher.
//!
//! OS hot-plug callbacks (libusb, where supported) or a poll timer only
//! trigger a rescan; the rescan diff is what the registry sees, as
//! [`WatcherMessage`]s on its channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rusb::UsbContext;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::error::TransportError;
use crate::identity::{DeviceIdentity, FriendlyUsbDevice, KEEPKEY_PIDS, KEEPKEY_VID};

const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(100);
const HOTPLUG_EVENT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherMessage {
    Arrived(FriendlyUsbDevice),
    Left(FriendlyUsbDevice),
}

/// Lists the KeepKeys currently attached.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<FriendlyUsbDevice>, TransportError>;
}

/// libusb enumeration, reading string descriptors where the device allows it.
#[derive(Debug, Default, Clone, Copy)]
pub struct RusbEnumerator;

impl DeviceEnumerator for RusbEnumerator {
    fn enumerate(&self) -> Result<Vec<FriendlyUsbDevice>, TransportError> {
        let mut found = Vec::new();
        for device in rusb::devices()?.iter() {
            let desc = match device.device_descriptor() {
                Ok(desc) => desc,
                Err(_) => continue,
            };
            if desc.vendor_id() != KEEPKEY_VID || !KEEPKEY_PIDS.contains(&desc.product_id()) {
                continue;
            }

            let (manufacturer, product, serial) = match device.open() {
                Ok(handle) => {
                    let lang = handle
                        .read_languages(DESCRIPTOR_TIMEOUT)
                        .ok()
                        .and_then(|langs| langs.first().copied());
                    (
                        lang.and_then(|l| handle.read_manufacturer_string(l, &desc, DESCRIPTOR_TIMEOUT).ok()),
                        lang.and_then(|l| handle.read_product_string(l, &desc, DESCRIPTOR_TIMEOUT).ok()),
                        lang.and_then(|l| handle.read_serial_number_string(l, &desc, DESCRIPTOR_TIMEOUT).ok()),
                    )
                }
                Err(e) => {
                    warn!(
                        "Could not open KeepKey device {:04x}:{:04x}: {}. Using default values.",
                        desc.vendor_id(),
                        desc.product_id(),
                        e
                    );
                    (Some("KeyHodlers, LLC".to_string()), Some("KeepKey".to_string()), None)
                }
            };

            found.push(FriendlyUsbDevice::new(
                desc.vendor_id(),
                desc.product_id(),
                device.bus_number(),
                device.address(),
                manufacturer,
                product,
                serial,
            ));
        }
        Ok(found)
    }
}

/// Compare a fresh scan against the known set and update it.
///
/// A device reporting no serial on the same bus/address as a known device
/// keeps the known identity. Departures are listed before arrivals.
pub fn diff_devices(
    known: &mut HashMap<DeviceIdentity, FriendlyUsbDevice>,
    scanned: Vec<FriendlyUsbDevice>,
) -> Vec<WatcherMessage> {
    let mut current: HashMap<DeviceIdentity, FriendlyUsbDevice> = HashMap::with_capacity(scanned.len());
    for mut device in scanned {
        if device.unique_id.is_fallback() {
            if let Some(previous) = known.values().find(|k| !k.unique_id.is_fallback() && k.same_port(&device)) {
                debug!("{} reported no serial; keeping identity {}", device.unique_id, previous.unique_id);
                device.unique_id = previous.unique_id.clone();
                device.serial_number = previous.serial_number.clone();
            }
        }
        current.insert(device.unique_id.clone(), device);
    }

    let mut messages = Vec::new();
    let gone: Vec<DeviceIdentity> = known.keys().filter(|id| !current.contains_key(*id)).cloned().collect();
    for id in gone {
        if let Some(device) = known.remove(&id) {
            info!("Device disconnected (scan): {} ID: {}", device.name, device.unique_id);
            messages.push(WatcherMessage::Left(device));
        }
    }
    for (id, device) in current {
        if !known.contains_key(&id) {
            info!("Device connected (scan): {} ({:04x}:{:04x}) ID: {}", device.name, device.vid, device.pid, id);
            known.insert(id, device.clone());
            messages.push(WatcherMessage::Arrived(device));
        }
    }
    messages
}

/// Hot-plug callback: nudges the monitor and returns immediately.
struct HotplugKick {
    kick: mpsc::UnboundedSender<()>,
}

impl<T: UsbContext> rusb::Hotplug<T> for HotplugKick {
    fn device_arrived(&mut self, _device: rusb::Device<T>) {
        let _ = self.kick.send(());
    }

    fn device_left(&mut self, _device: rusb::Device<T>) {
        let _ = self.kick.send(());
    }
}

/// Run libusb hot-plug on its own thread. The kick channel closes if
/// registration fails, which drops the monitor back to polling.
fn spawn_hotplug_listener(cancel: CancellationToken) -> Option<mpsc::UnboundedReceiver<()>> {
    if !rusb::has_hotplug() {
        info!("libusb hot-plug not supported here; polling instead");
        return None;
    }
    let (kick_tx, kick_rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("keepkey-hotplug".into())
        .spawn(move || {
            // libusb context must live on the same thread that calls handle_events()
            let mut context = match rusb::Context::new() {
                Ok(context) => context,
                Err(e) => {
                    error!("Failed to initialize libusb context: {}", e);
                    return;
                }
            };
            let registration = rusb::HotplugBuilder::new()
                .vendor_id(KEEPKEY_VID)
                .enumerate(false)
                .register(&mut context, Box::new(HotplugKick { kick: kick_tx }));
            let _registration: rusb::Registration<rusb::Context> = match registration {
                Ok(registration) => registration,
                Err(e) => {
                    error!("Failed to register rusb hotplug callback: {}", e);
                    return;
                }
            };
            info!("rusb hotplug registration successful");
            while !cancel.is_cancelled() {
                if let Err(e) = context.handle_events(Some(HOTPLUG_EVENT_TIMEOUT)) {
                    error!("rusb handle_events error: {}", e);
                }
            }
            info!("rusb hotplug listener stopping.");
        });
    match spawned {
        Ok(_) => Some(kick_rx),
        Err(e) => {
            error!("Failed to spawn hotplug thread: {}", e);
            None
        }
    }
}

pub struct UsbMonitor {
    enumerator: Arc<dyn DeviceEnumerator>,
    config: WatcherConfig,
    tx: mpsc::UnboundedSender<WatcherMessage>,
    known: HashMap<DeviceIdentity, FriendlyUsbDevice>,
}

impl UsbMonitor {
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        config: WatcherConfig,
        tx: mpsc::UnboundedSender<WatcherMessage>,
    ) -> Self {
        Self {
            enumerator,
            config,
            tx,
            known: HashMap::new(),
        }
    }

    /// Start watching on the current runtime until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut kicks = if self.config.prefer_hotplug {
            spawn_hotplug_listener(cancel.child_token())
        } else {
            None
        };
        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "USB monitor started ({})",
            if kicks.is_some() { "hot-plug" } else { "polling" }
        );
        self.scan().await;

        loop {
            let mut listener_closed = false;
            if let Some(rx) = kicks.as_mut() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    kick = rx.recv() => listener_closed = kick.is_none(),
                }
                // One rescan covers a burst of callbacks.
                while rx.try_recv().is_ok() {}
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = poll.tick() => {}
                }
            }
            if listener_closed {
                warn!("Hot-plug listener stopped; falling back to polling");
                kicks = None;
                continue;
            }
            self.scan().await;
        }
        info!("USB monitor stopped");
    }

    /// Enumerate once and forward the differences.
    pub async fn scan(&mut self) {
        let enumerator = Arc::clone(&self.enumerator);
        let scanned = match tokio::task::spawn_blocking(move || enumerator.enumerate()).await {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                warn!("USB enumeration failed: {}", e);
                return;
            }
            Err(e) => {
                error!("USB enumeration task failed: {}", e);
                return;
            }
        };
        for message in diff_devices(&mut self.known, scanned) {
            if self.tx.send(message).is_err() {
                debug!("Registry channel closed; dropping watcher message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KEEPKEY_WEBUSB_PID;

    fn device(serial: Option<&str>, bus: u8, address: u8) -> FriendlyUsbDevice {
        FriendlyUsbDevice::new(
            KEEPKEY_VID,
            KEEPKEY_WEBUSB_PID,
            bus,
            address,
            Some("KeyHodlers, LLC".into()),
            Some("KeepKey".into()),
            serial.map(str::to_string),
        )
    }

    #[test]
    fn arrivals_and_departures() {
        let mut known = HashMap::new();
        let first = diff_devices(&mut known, vec![device(Some("AAA"), 1, 4)]);
        assert!(matches!(&first[..], [WatcherMessage::Arrived(d)] if d.unique_id.as_str() == "AAA"));

        assert!(diff_devices(&mut known, vec![device(Some("AAA"), 1, 4)]).is_empty());

        let second = diff_devices(&mut known, vec![device(Some("BBB"), 1, 5)]);
        assert!(matches!(&second[0], WatcherMessage::Left(d) if d.unique_id.as_str() == "AAA"));
        assert!(matches!(&second[1], WatcherMessage::Arrived(d) if d.unique_id.as_str() == "BBB"));
    }

    #[test]
    fn missing_serial_on_same_port_keeps_identity() {
        let mut known = HashMap::new();
        diff_devices(&mut known, vec![device(Some("AAA"), 0, 2)]);
        assert!(diff_devices(&mut known, vec![device(Some(""), 0, 2)]).is_empty());
        assert!(known.contains_key(&DeviceIdentity::from("AAA")));
    }

    #[tokio::test]
    async fn scan_forwards_enumeration_diff() {
        let mut enumerator = MockDeviceEnumerator::new();
        let mut calls = 0;
        enumerator.expect_enumerate().times(2).returning(move || {
            calls += 1;
            Ok(if calls == 1 { vec![device(None, 0, 2)] } else { vec![] })
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = UsbMonitor::new(Arc::new(enumerator), WatcherConfig::default(), tx);

        monitor.scan().await;
        match rx.recv().await.unwrap() {
            WatcherMessage::Arrived(d) => assert_eq!(d.unique_id.as_str(), "keepkey_2b24_0002_bus0_addr2"),
            other => panic!("unexpected {:?}", other),
        }
        monitor.scan().await;
        assert!(matches!(rx.recv().await.unwrap(), WatcherMessage::Left(_)));
    }

    #[tokio::test]
    async fn enumeration_errors_are_skipped() {
        let mut enumerator = MockDeviceEnumerator::new();
        enumerator
            .expect_enumerate()
            .returning(|| Err(TransportError::PermissionDenied("udev".into())));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor = UsbMonitor::new(Arc::new(enumerator), WatcherConfig::default(), tx);
        monitor.scan().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn polling_monitor_stops_on_cancel() {
        let mut enumerator = MockDeviceEnumerator::new();
        enumerator.expect_enumerate().returning(|| Ok(vec![device(Some("AAA"), 1, 1)]));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = WatcherConfig {
            prefer_hotplug: false,
            poll_interval_ms: 10,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let task = UsbMonitor::new(Arc::new(enumerator), config, tx).spawn(cancel.clone());

        assert!(matches!(rx.recv().await.unwrap(), WatcherMessage::Arrived(_)));
        cancel.cancel();
        task.await.unwrap();
    }
}
