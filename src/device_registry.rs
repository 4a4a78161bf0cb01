//! Process-wide device registry.
//!
//! One registry owns the device map, the per-device workers and the watcher
//! channel. Consumers get a cloned [`DeviceRegistry`] handle; nobody locks
//! the map directly, and no map guard is ever held across device I/O.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::blocking_actions::{BlockingAction, BlockingActionsState};
use crate::config::WatcherConfig;
use crate::device_queue::{DeviceQueueFactory, DeviceQueueHandle, QueueStatus};
use crate::error::DeviceError;
use crate::events::{DeviceEvent, EventBus};
use crate::features::DeviceFeatures;
use crate::identity::{DeviceIdentity, FriendlyUsbDevice};
use crate::session::SessionKind;
use crate::updates::{baseline_actions, FirmwareReleases};
use crate::usb_monitor::{DeviceEnumerator, UsbMonitor, WatcherMessage};

const FEATURE_RETRY_BACKOFF: Duration = Duration::from_millis(500);

// Define a struct to hold device data including features and queue handle
#[derive(Clone, Debug)]
pub struct DeviceEntry {
    pub device: FriendlyUsbDevice,
    pub features: Option<DeviceFeatures>,
    pub last_seen: u64, // Unix timestamp in seconds
    /// False while a held identity is unplugged.
    pub connected: bool,
    pub queue_handle: Option<DeviceQueueHandle>,
}

// Serializable version for subscribers (excluding queue handle)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEntrySerializable {
    pub device: FriendlyUsbDevice,
    pub features: Option<DeviceFeatures>,
    pub last_seen: u64,
    pub connected: bool,
}

impl From<&DeviceEntry> for DeviceEntrySerializable {
    fn from(entry: &DeviceEntry) -> Self {
        Self {
            device: entry.device.clone(),
            features: entry.features.clone(),
            last_seen: entry.last_seen,
            connected: entry.connected,
        }
    }
}

struct RegistryInner {
    devices: DashMap<DeviceIdentity, DeviceEntry>,
    // identity -> number of live session holds
    holds: DashMap<DeviceIdentity, usize>,
    // identity reported by the OS -> held identity it stands in for
    aliases: DashMap<DeviceIdentity, DeviceIdentity>,
    // credential the device asked for that no session has answered yet;
    // invalid once the device leaves or another command reaches it
    prompts: DashMap<DeviceIdentity, SessionKind>,
    workers: DeviceQueueFactory,
    events: EventBus,
    blocking: BlockingActionsState,
    releases: Option<FirmwareReleases>,
    watcher: WatcherConfig,
    watcher_tx: mpsc::UnboundedSender<WatcherMessage>,
    monitor: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl DeviceRegistry {
    /// Build the registry and start consuming watcher messages on the current runtime.
    pub fn new(
        workers: DeviceQueueFactory,
        events: EventBus,
        blocking: BlockingActionsState,
        watcher: WatcherConfig,
        releases: Option<FirmwareReleases>,
    ) -> Self {
        let (watcher_tx, mut watcher_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RegistryInner {
            devices: DashMap::new(),
            holds: DashMap::new(),
            aliases: DashMap::new(),
            prompts: DashMap::new(),
            workers,
            events,
            blocking,
            releases,
            watcher,
            watcher_tx,
            monitor: Mutex::new(None),
        });

        let weak: Weak<RegistryInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(message) = watcher_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                DeviceRegistry { inner }.apply_watcher_message(message);
            }
            debug!("Registry watcher loop ended");
        });

        Self { inner }
    }

    /// Channel the watcher pushes arrivals and departures onto.
    pub fn sender(&self) -> mpsc::UnboundedSender<WatcherMessage> {
        self.inner.watcher_tx.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn blocking_actions(&self) -> &BlockingActionsState {
        &self.inner.blocking
    }

    pub fn releases(&self) -> Option<&FirmwareReleases> {
        self.inner.releases.as_ref()
    }

    /// Start the one USB watcher feeding this registry. Returns false if one is already running.
    pub fn start_monitor(&self, enumerator: Arc<dyn DeviceEnumerator>) -> bool {
        let mut monitor = match self.inner.monitor.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if monitor.is_some() {
            warn!("USB monitor already running; not starting another");
            return false;
        }
        let cancel = CancellationToken::new();
        UsbMonitor::new(enumerator, self.inner.watcher.clone(), self.sender()).spawn(cancel.clone());
        *monitor = Some(cancel);
        true
    }

    pub fn stop_monitor(&self) {
        let token = match self.inner.monitor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Apply one watcher message. Feature fetches it triggers run on their own tasks.
    pub fn apply_watcher_message(&self, message: WatcherMessage) {
        match message {
            WatcherMessage::Arrived(device) => self.on_arrived(device),
            WatcherMessage::Left(device) => self.on_left(device),
        }
    }

    /// Map an OS-reported identity onto the held identity it stands in for.
    pub fn resolve_id(&self, device_id: &str) -> DeviceIdentity {
        let id = DeviceIdentity::from(device_id);
        match self.inner.aliases.get(&id) {
            Some(target) => target.clone(),
            None => id,
        }
    }

    fn on_arrived(&self, device: FriendlyUsbDevice) {
        let reported = device.unique_id.clone();
        let now = unix_now();

        let (id, device) = match self.alias_target(&device) {
            Some(held) => {
                info!("{} arrived without a serial; resuming held identity {}", reported, held);
                self.inner.aliases.insert(reported, held.clone());
                let mut aliased = device;
                aliased.unique_id = held.clone();
                if let Some(entry) = self.inner.devices.get(&held) {
                    aliased.serial_number = entry.device.serial_number.clone();
                }
                (held, aliased)
            }
            None => (reported, device),
        };

        let was_connected = {
            let mut entry = self.inner.devices.entry(id.clone()).or_insert_with(|| DeviceEntry {
                device: device.clone(),
                features: None,
                last_seen: now,
                connected: false,
                queue_handle: None,
            });
            let was_connected = entry.connected;
            entry.device = device.clone();
            entry.last_seen = now;
            entry.connected = true;
            if let Some(handle) = &entry.queue_handle {
                handle.update_device_info(device.clone());
            }
            was_connected
        };
        if was_connected {
            return;
        }

        info!("Device connected: {} ({:04x}:{:04x}) ID: {}", device.name, device.vid, device.pid, id);
        self.inner.events.emit(DeviceEvent::DeviceConnected {
            device_id: id.to_string(),
            device: device.clone(),
        });

        if device.is_keepkey && self.inner.watcher.fetch_features_on_connect {
            let registry = self.clone();
            tokio::spawn(async move { registry.fetch_features_on_connect(id).await });
        }
    }

    /// A fallback-id arrival stands in for a held identity when exactly one
    /// held identity of the same vendor is currently unplugged.
    fn alias_target(&self, device: &FriendlyUsbDevice) -> Option<DeviceIdentity> {
        if !device.unique_id.is_fallback() || self.inner.devices.contains_key(&device.unique_id) {
            return None;
        }
        let candidates: Vec<DeviceIdentity> = self
            .inner
            .holds
            .iter()
            .map(|hold| hold.key().clone())
            .filter(|id| {
                self.inner
                    .devices
                    .get(id)
                    .map_or(false, |entry| !entry.connected && entry.device.vid == device.vid)
            })
            .collect();
        match candidates.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }

    fn on_left(&self, device: FriendlyUsbDevice) {
        let reported = device.unique_id.clone();
        let id = self.resolve_id(reported.as_str());
        if id != reported {
            self.inner.aliases.remove(&reported);
        }
        if self.inner.prompts.remove(&id).is_some() {
            debug!("Dropped pending prompt for departed device {}", id);
        }

        if self.is_held(&id) {
            let changed = match self.inner.devices.get_mut(&id) {
                Some(mut entry) if entry.connected => {
                    entry.connected = false;
                    true
                }
                _ => false,
            };
            if changed {
                info!("Held device {} unplugged; keeping its identity for the active session", id);
                self.inner.events.emit(DeviceEvent::DeviceDisconnected { device_id: id.to_string() });
            }
            return;
        }

        if let Some((_, entry)) = self.inner.devices.remove(&id) {
            info!("Device disconnected: {} ID: {}", entry.device.name, id);
            if let Some(handle) = entry.queue_handle {
                // Attempt graceful shutdown, but don't block removal if it fails
                tokio::spawn(async move {
                    if let Err(e) = handle.shutdown().await {
                        debug!("Failed to shutdown device queue for {}: {}", handle.device_id(), e);
                    }
                });
            }
            self.inner.blocking.clear_device(id.as_str());
            self.inner.events.emit(DeviceEvent::DeviceDisconnected { device_id: id.to_string() });
        }
    }

    pub fn list_connected_devices(&self) -> Vec<FriendlyUsbDevice> {
        let mut devices: Vec<FriendlyUsbDevice> = self
            .inner
            .devices
            .iter()
            .filter(|entry| entry.connected)
            .map(|entry| entry.device.clone())
            .collect();
        devices.sort_by(|a, b| a.unique_id.cmp(&b.unique_id));
        devices
    }

    pub fn entries(&self) -> Vec<DeviceEntrySerializable> {
        let mut entries: Vec<DeviceEntrySerializable> =
            self.inner.devices.iter().map(|entry| entry.value().into()).collect();
        entries.sort_by(|a, b| a.device.unique_id.cmp(&b.device.unique_id));
        entries
    }

    pub fn entry(&self, device_id: &str) -> Option<DeviceEntrySerializable> {
        let id = self.resolve_id(device_id);
        self.inner.devices.get(&id).map(|entry| entry.value().into())
    }

    pub fn features(&self, device_id: &str) -> Option<DeviceFeatures> {
        let id = self.resolve_id(device_id);
        self.inner.devices.get(&id).and_then(|entry| entry.features.clone())
    }

    pub fn has_worker(&self, device_id: &str) -> bool {
        let id = self.resolve_id(device_id);
        self.inner
            .devices
            .get(&id)
            .is_some_and(|entry| entry.queue_handle.as_ref().is_some_and(|handle| handle.is_alive()))
    }

    /// Queue status without spawning a worker; a device that has none yet
    /// reports an idle, empty queue.
    pub fn queue_status(&self, device_id: &str) -> Result<QueueStatus, DeviceError> {
        let id = self.resolve_id(device_id);
        let entry = self.inner.devices.get(&id).ok_or_else(|| DeviceError::NotFound {
            device_id: id.to_string(),
        })?;
        Ok(match entry.queue_handle.as_ref().filter(|handle| handle.is_alive()) {
            Some(handle) => handle.status(),
            None => QueueStatus::idle(id.as_str()),
        })
    }

    /// The worker for `device_id`, spawning it on first use. Never creates a
    /// second worker for an identity that already has a live one.
    pub fn get_or_spawn_worker(&self, device_id: &str) -> Result<DeviceQueueHandle, DeviceError> {
        let id = self.resolve_id(device_id);
        let mut entry = self.inner.devices.get_mut(&id).ok_or_else(|| DeviceError::NotFound {
            device_id: id.to_string(),
        })?;
        if let Some(handle) = entry.queue_handle.as_ref().filter(|handle| handle.is_alive()) {
            return Ok(handle.clone());
        }
        debug!("Spawning worker for {}", id);
        let handle = self.inner.workers.spawn_worker(id.to_string(), entry.device.clone());
        entry.queue_handle = Some(handle.clone());
        Ok(handle)
    }

    /// Fetch a fresh snapshot, replace the cached one and re-derive blocking actions.
    #[instrument(level = "debug", skip(self))]
    pub async fn refresh_features(&self, device_id: &str) -> Result<DeviceFeatures, DeviceError> {
        let id = self.resolve_id(device_id);
        // GetFeatures would abort the PIN, passphrase or recovery screen.
        if self.is_held(&id) {
            return self.features(id.as_str()).ok_or_else(|| DeviceError::Busy {
                device_id: id.to_string(),
                action: "GetFeatures".into(),
            });
        }
        let handle = self.get_or_spawn_worker(id.as_str())?;
        self.clear_pending_prompt(&id);
        let features = handle.get_features().await?;
        let snapshot = DeviceFeatures::from_message(features, self.inner.releases.as_ref());
        self.store_features(&id, snapshot.clone());
        Ok(snapshot)
    }

    fn store_features(&self, id: &DeviceIdentity, snapshot: DeviceFeatures) {
        if let Some(mut entry) = self.inner.devices.get_mut(id) {
            entry.features = Some(snapshot.clone());
            entry.last_seen = unix_now();
        }

        let actions = match &self.inner.releases {
            Some(releases) => releases.evaluate_device(id.as_str(), &snapshot),
            None => baseline_actions(id.as_str(), &snapshot),
        };
        if !actions.is_empty() {
            info!("{} has {} blocking action(s)", id, actions.len());
        }
        self.inner.blocking.replace_for_device(id.as_str(), actions);

        self.inner.events.emit(DeviceEvent::DeviceUpdated {
            device_id: id.to_string(),
            features: Some(snapshot),
            error: None,
        });
    }

    /// Connect-time snapshot with bounded retries. Skipped while a session
    /// holds the identity, since a GetFeatures would abort an in-progress
    /// PIN or recovery flow on the device.
    async fn fetch_features_on_connect(&self, id: DeviceIdentity) {
        let attempts = self.inner.watcher.feature_fetch_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if self.is_held(&id) {
                info!("🔒 {} is in a session flow - skipping automatic feature fetch", id);
                return;
            }
            debug!("🔄 Attempting to get features for device {} (attempt {}/{})", id, attempt, attempts);
            match self.refresh_features(id.as_str()).await {
                Ok(features) => {
                    info!("✅ Got features for device {} (v{}) on attempt {}", id, features.version, attempt);
                    return;
                }
                Err(DeviceError::NotFound { .. } | DeviceError::Busy { .. }) => return,
                Err(e) => {
                    warn!("⚠️ Failed to get features for device {} on attempt {}: {}", id, attempt, e);
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(FEATURE_RETRY_BACKOFF * attempt).await;
            }
        }

        if let Some(err) = last_error {
            let detail = err.to_string();
            self.inner
                .blocking
                .add_action(BlockingAction::new_communication_failure(id.as_str(), &detail));
            self.inner.events.emit(DeviceEvent::DeviceUpdated {
                device_id: id.to_string(),
                features: None,
                error: Some(detail),
            });
        }
    }

    /// Record that the device is showing a `kind` prompt nobody answered yet.
    pub(crate) fn set_pending_prompt(&self, id: &DeviceIdentity, kind: SessionKind) {
        debug!("{} is waiting for a {}", id, kind);
        self.inner.prompts.insert(id.clone(), kind);
    }

    /// Consume a pending `kind` prompt, if the device is still showing it.
    pub(crate) fn take_pending_prompt(&self, id: &DeviceIdentity, kind: SessionKind) -> bool {
        self.inner.prompts.remove_if(id, |_, pending| *pending == kind).is_some()
    }

    /// Forget any pending prompt; call before sending a command that is not
    /// an answer to it.
    pub fn clear_pending_prompt(&self, id: &DeviceIdentity) {
        self.inner.prompts.remove(id);
    }

    pub fn is_held(&self, id: &DeviceIdentity) -> bool {
        self.inner.holds.get(id).map_or(false, |count| *count > 0)
    }

    /// Keep `device_id` registered across unplug/replug until the hold drops.
    pub fn hold(&self, device_id: &str) -> IdentityHold {
        let id = self.resolve_id(device_id);
        *self.inner.holds.entry(id.clone()).or_insert(0) += 1;
        debug!("Identity {} held", id);
        IdentityHold {
            registry: Arc::downgrade(&self.inner),
            device_id: id,
        }
    }

    fn release(&self, id: &DeviceIdentity) {
        let released = match self.inner.holds.get_mut(id) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if !released {
            return;
        }
        self.inner.holds.remove_if(id, |_, count| *count == 0);
        self.inner.aliases.retain(|_, target| target != id);

        // An identity kept only for its session goes away with it.
        if self.inner.devices.remove_if(id, |_, entry| !entry.connected).is_some() {
            info!("Released identity {} was unplugged; removing it", id);
            self.inner.blocking.clear_device(id.as_str());
        }
    }
}

/// Session-scoped hold on a device identity. Dropping it releases the hold.
#[derive(Debug)]
pub struct IdentityHold {
    registry: Weak<RegistryInner>,
    device_id: DeviceIdentity,
}

impl IdentityHold {
    pub fn device_id(&self) -> &DeviceIdentity {
        &self.device_id
    }
}

impl Drop for IdentityHold {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            DeviceRegistry { inner }.release(&self.device_id);
        }
    }
}

impl std::fmt::Debug for RegistryInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryInner")
            .field("devices", &self.devices.len())
            .field("holds", &self.holds.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking_actions::BlockingActionType;
    use crate::identity::{KEEPKEY_VID, KEEPKEY_WEBUSB_PID};
    use crate::messages::Message;
    use crate::transport::mock::{mock_usb_device, MockDevice, MockTransportFactory};
    use tokio::sync::broadcast;

    fn registry(device: &MockDevice, watcher: WatcherConfig) -> DeviceRegistry {
        let events = EventBus::new(128);
        DeviceRegistry::new(
            DeviceQueueFactory::new(Arc::new(MockTransportFactory::single(device.clone()))),
            events.clone(),
            BlockingActionsState::with_events(events),
            watcher,
            None,
        )
    }

    fn no_fetch() -> WatcherConfig {
        WatcherConfig {
            fetch_features_on_connect: false,
            ..Default::default()
        }
    }

    async fn wait_for(rx: &mut broadcast::Receiver<DeviceEvent>, pred: impl Fn(&DeviceEvent) -> bool) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn arrival_fetches_features_and_publishes() {
        let device = MockDevice::keepkey();
        let registry = registry(&device, WatcherConfig::default());
        let mut rx = registry.events().subscribe();

        registry.sender().send(WatcherMessage::Arrived(mock_usb_device("AAA"))).unwrap();

        let connected = wait_for(&mut rx, |e| matches!(e, DeviceEvent::DeviceConnected { .. })).await;
        assert_eq!(connected.device_id(), Some("AAA"));
        wait_for(&mut rx, |e| matches!(e, DeviceEvent::DeviceUpdated { features: Some(_), .. })).await;

        assert_eq!(registry.features("AAA").unwrap().version, "7.10.0");
        assert_eq!(registry.list_connected_devices().len(), 1);
        assert!(!registry.blocking_actions().has_blocking_actions("AAA"));
    }

    #[tokio::test]
    async fn departure_removes_entry_and_actions() {
        let device = MockDevice::keepkey();
        let registry = registry(&device, no_fetch());
        let mut rx = registry.events().subscribe();
        let usb = mock_usb_device("AAA");

        registry.apply_watcher_message(WatcherMessage::Arrived(usb.clone()));
        registry
            .blocking_actions()
            .add_action(BlockingAction::new_device_initialization("AAA"));
        registry.apply_watcher_message(WatcherMessage::Left(usb));

        wait_for(&mut rx, |e| matches!(e, DeviceEvent::DeviceDisconnected { .. })).await;
        assert!(registry.entry("AAA").is_none());
        assert_eq!(registry.blocking_actions().total_action_count(), 0);
    }

    #[tokio::test]
    async fn one_worker_per_identity() {
        let device = MockDevice::keepkey();
        let registry = registry(&device, no_fetch());
        registry.apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("AAA")));

        let first = registry.get_or_spawn_worker("AAA").unwrap();
        let second = registry.get_or_spawn_worker("AAA").unwrap();
        first.get_features().await.unwrap();
        second.get_features().await.unwrap();

        assert_eq!(device.opens(), 1);
        assert!(matches!(
            registry.get_or_spawn_worker("nope"),
            Err(DeviceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn held_identity_survives_reconnect_without_serial() {
        let device = MockDevice::keepkey();
        let registry = registry(&device, no_fetch());
        let usb = mock_usb_device("AAA");
        registry.apply_watcher_message(WatcherMessage::Arrived(usb.clone()));
        let hold = registry.hold("AAA");

        registry.apply_watcher_message(WatcherMessage::Left(usb));
        let entry = registry.entry("AAA").unwrap();
        assert!(!entry.connected);

        let replug = FriendlyUsbDevice::new(KEEPKEY_VID, KEEPKEY_WEBUSB_PID, 0, 2, None, None, Some(String::new()));
        let fallback = replug.unique_id.clone();
        assert!(fallback.is_fallback());
        registry.apply_watcher_message(WatcherMessage::Arrived(replug.clone()));

        assert_eq!(registry.resolve_id(fallback.as_str()).as_str(), "AAA");
        let entry = registry.entry("AAA").unwrap();
        assert!(entry.connected);
        assert_eq!(entry.device.address, 2);
        assert_eq!(registry.list_connected_devices().len(), 1);
        assert_eq!(registry.get_or_spawn_worker(fallback.as_str()).unwrap().device_id(), "AAA");

        drop(hold);
        registry.apply_watcher_message(WatcherMessage::Left(replug));
        assert!(registry.entry("AAA").is_none());
    }

    #[tokio::test]
    async fn releasing_an_unplugged_hold_forgets_it() {
        let device = MockDevice::keepkey();
        let registry = registry(&device, no_fetch());
        let usb = mock_usb_device("AAA");
        registry.apply_watcher_message(WatcherMessage::Arrived(usb.clone()));
        let hold = registry.hold("AAA");
        registry.apply_watcher_message(WatcherMessage::Left(usb));
        assert!(registry.entry("AAA").is_some());

        drop(hold);
        assert!(registry.entry("AAA").is_none());
    }

    #[tokio::test]
    async fn departure_drops_pending_prompts() {
        let device = MockDevice::keepkey();
        let registry = registry(&device, no_fetch());
        let usb = mock_usb_device("AAA");
        let id = DeviceIdentity::from("AAA");
        registry.apply_watcher_message(WatcherMessage::Arrived(usb.clone()));

        registry.set_pending_prompt(&id, SessionKind::Passphrase);
        assert!(!registry.take_pending_prompt(&id, SessionKind::Pin));
        assert!(registry.take_pending_prompt(&id, SessionKind::Passphrase));
        assert!(!registry.take_pending_prompt(&id, SessionKind::Passphrase));

        // held: the entry stays but the prompt does not
        let _hold = registry.hold("AAA");
        registry.set_pending_prompt(&id, SessionKind::Pin);
        registry.apply_watcher_message(WatcherMessage::Left(usb.clone()));
        assert!(registry.entry("AAA").is_some());
        registry.apply_watcher_message(WatcherMessage::Arrived(usb));
        assert!(!registry.take_pending_prompt(&id, SessionKind::Pin));
    }

    #[tokio::test]
    async fn held_devices_get_no_feature_request_on_connect() {
        let device = MockDevice::keepkey();
        let registry = registry(&device, WatcherConfig::default());
        let usb = mock_usb_device("AAA");
        registry.apply_watcher_message(WatcherMessage::Arrived(usb.clone()));
        let mut rx = registry.events().subscribe();
        wait_for(&mut rx, |e| matches!(e, DeviceEvent::DeviceUpdated { .. })).await;
        let sent = device.received().len();

        let _hold = registry.hold("AAA");
        registry.apply_watcher_message(WatcherMessage::Left(usb.clone()));
        registry.apply_watcher_message(WatcherMessage::Arrived(usb));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(device.received().len(), sent);
    }

    #[tokio::test]
    async fn unreachable_device_gets_communication_failure() {
        let device = MockDevice::new(|_| vec![]);
        let registry = registry(
            &device,
            WatcherConfig {
                feature_fetch_attempts: 1,
                ..Default::default()
            },
        );
        let mut rx = registry.events().subscribe();
        registry.apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("AAA")));

        let event = wait_for(&mut rx, |e| matches!(e, DeviceEvent::DeviceUpdated { .. })).await;
        assert!(matches!(event, DeviceEvent::DeviceUpdated { features: None, error: Some(_), .. }));
        let top = registry.blocking_actions().highest_priority_action("AAA").unwrap();
        assert_eq!(top.action_type, BlockingActionType::DeviceCommunicationFailure);
    }

    #[tokio::test]
    async fn uninitialized_device_needs_initialization() {
        let device = MockDevice::new(|msg| match msg {
            Message::GetFeatures(_) => {
                let mut features = MockDevice::features();
                features.initialized = Some(false);
                vec![features.into()]
            }
            _ => vec![],
        });
        let registry = registry(&device, no_fetch());
        registry.apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("AAA")));

        let snapshot = registry.refresh_features("AAA").await.unwrap();
        assert!(!snapshot.initialized);
        let top = registry.blocking_actions().highest_priority_action("AAA").unwrap();
        assert_eq!(top.action_type, BlockingActionType::DeviceInitialization);
    }
}
