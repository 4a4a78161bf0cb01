//! Command-style API for application, server and CLI front ends.
//!
//! A process builds one [`KeepKeyService`] and hands clones of it to every
//! consumer, so they all read the same registry.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::blocking_actions::{BlockingAction, BlockingActionType, BlockingActionsState};
use crate::config::CoreConfig;
use crate::device_queue::{DeviceQueueFactory, QueueStatus};
use crate::device_registry::{DeviceEntrySerializable, DeviceRegistry};
use crate::error::{ConfigError, DeviceError, SessionError};
use crate::events::{DeviceEvent, EventBus};
use crate::features::DeviceFeatures;
use crate::identity::FriendlyUsbDevice;
use crate::session::{
    PassphraseResult, PassphraseSessionInfo, PinSessionInfo, PinUnlockResult, RecoveryAction, RecoveryProgress,
    RecoverySessionInfo, SessionManager,
};
use crate::transport::{TransportFactory, UsbHidTransportFactory};
use crate::updates::FirmwareReleases;
use crate::usb_monitor::{DeviceEnumerator, RusbEnumerator};

#[derive(Clone)]
pub struct KeepKeyService {
    config: CoreConfig,
    registry: DeviceRegistry,
    sessions: Arc<SessionManager>,
}

impl KeepKeyService {
    /// Wire the registry, workers and sessions over `transports`.
    /// Must be called inside a Tokio runtime.
    pub fn new(config: CoreConfig, transports: Arc<dyn TransportFactory>) -> Result<Self, ConfigError> {
        config.validate()?;
        let releases = match &config.releases_path {
            Some(path) => Some(FirmwareReleases::load(path)?),
            None => None,
        };
        let events = EventBus::new(config.event_capacity);
        let workers = DeviceQueueFactory::new(transports)
            .with_config(config.queue.clone())
            .with_events(events.clone());
        let registry = DeviceRegistry::new(
            workers,
            events.clone(),
            BlockingActionsState::with_events(events),
            config.watcher.clone(),
            releases,
        );
        let sessions = Arc::new(SessionManager::new(registry.clone(), config.session.clone()));
        Ok(Self {
            config,
            registry,
            sessions,
        })
    }

    /// Real hardware: WebUSB first, HID as fallback.
    pub fn usb(config: CoreConfig) -> Result<Self, ConfigError> {
        Self::new(config, Arc::new(UsbHidTransportFactory::new()))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.registry.events().subscribe()
    }

    /// Start watching libusb for KeepKeys.
    pub fn start_usb_monitor(&self) -> bool {
        self.start_monitor(Arc::new(RusbEnumerator))
    }

    pub fn start_monitor(&self, enumerator: Arc<dyn DeviceEnumerator>) -> bool {
        let started = self.registry.start_monitor(enumerator);
        if started {
            info!("Device monitor started");
        }
        started
    }

    pub fn stop(&self) {
        self.registry.stop_monitor();
    }

    pub fn list_connected_devices(&self) -> Vec<FriendlyUsbDevice> {
        self.registry.list_connected_devices()
    }

    pub fn device_entries(&self) -> Vec<DeviceEntrySerializable> {
        self.registry.entries()
    }

    /// Cached snapshot, fetched from the device on first use.
    pub async fn get_device_features_by_id(&self, device_id: &str) -> Result<DeviceFeatures, DeviceError> {
        match self.registry.features(device_id) {
            Some(features) => Ok(features),
            None => self.registry.refresh_features(device_id).await,
        }
    }

    pub async fn refresh_features(&self, device_id: &str) -> Result<DeviceFeatures, DeviceError> {
        self.registry.refresh_features(device_id).await
    }

    pub fn get_queue_status(&self, device_id: &str) -> Result<QueueStatus, DeviceError> {
        self.registry.queue_status(device_id)
    }

    pub async fn firmware_upload(&self, device_id: &str, payload: Vec<u8>) -> Result<(), DeviceError> {
        let handle = self.registry.get_or_spawn_worker(device_id)?;
        self.registry.clear_pending_prompt(&self.registry.resolve_id(device_id));
        handle.firmware_upload(payload).await?;
        self.registry
            .blocking_actions()
            .resolve(handle.device_id(), BlockingActionType::FirmwareUpdate);
        Ok(())
    }

    pub async fn reset_transport(&self, device_id: &str) -> Result<(), DeviceError> {
        let handle = self.registry.get_or_spawn_worker(device_id)?;
        self.registry.clear_pending_prompt(&self.registry.resolve_id(device_id));
        handle.reset_transport().await
    }

    pub fn blocking_actions(&self) -> &BlockingActionsState {
        self.registry.blocking_actions()
    }

    pub fn highest_priority_action(&self, device_id: &str) -> Option<BlockingAction> {
        let id = self.registry.resolve_id(device_id);
        self.blocking_actions().highest_priority_action(id.as_str())
    }

    pub fn resolve_blocking_action(&self, device_id: &str, action_type: BlockingActionType) -> bool {
        let id = self.registry.resolve_id(device_id);
        self.blocking_actions().resolve(id.as_str(), action_type)
    }

    pub async fn start_pin_unlock(&self, device_id: &str) -> Result<PinSessionInfo, SessionError> {
        self.sessions.start_pin_unlock(device_id).await
    }

    pub async fn send_pin_unlock_response(
        &self,
        session_id: Uuid,
        positions: &[u8],
    ) -> Result<PinUnlockResult, SessionError> {
        self.sessions.send_pin_unlock_response(session_id, positions).await
    }

    pub async fn cancel_pin_unlock(&self, session_id: Uuid) -> Result<bool, SessionError> {
        self.sessions.cancel_pin_unlock(session_id).await
    }

    pub async fn force_cleanup_pin(&self, device_id: &str) -> Result<bool, SessionError> {
        self.sessions.force_cleanup_pin(device_id).await
    }

    pub async fn start_passphrase(&self, device_id: &str) -> Result<PassphraseSessionInfo, SessionError> {
        self.sessions.start_passphrase(device_id).await
    }

    pub async fn send_passphrase(&self, session_id: Uuid, passphrase: &str) -> Result<PassphraseResult, SessionError> {
        self.sessions.send_passphrase(session_id, passphrase).await
    }

    pub async fn cancel_passphrase(&self, session_id: Uuid) -> Result<bool, SessionError> {
        self.sessions.cancel_passphrase(session_id).await
    }

    pub async fn force_cleanup_passphrase(&self, device_id: &str) -> Result<bool, SessionError> {
        self.sessions.force_cleanup_passphrase(device_id).await
    }

    pub async fn start_seed_verification(
        &self,
        device_id: &str,
        word_count: u32,
    ) -> Result<RecoverySessionInfo, SessionError> {
        self.sessions.start_seed_verification(device_id, word_count).await
    }

    pub async fn send_verification_pin(&self, session_id: Uuid, positions: &[u8]) -> Result<RecoveryProgress, SessionError> {
        self.sessions.send_verification_pin(session_id, positions).await
    }

    pub async fn send_verification_character(
        &self,
        session_id: Uuid,
        character: Option<&str>,
        action: Option<RecoveryAction>,
    ) -> Result<RecoveryProgress, SessionError> {
        self.sessions
            .send_verification_character(session_id, character, action)
            .await
    }

    pub async fn cancel_seed_verification(&self, session_id: Uuid) -> Result<bool, SessionError> {
        self.sessions.cancel_seed_verification(session_id).await
    }

    pub async fn force_cleanup_seed_verification(&self, device_id: &str) -> Result<bool, SessionError> {
        self.sessions.force_cleanup_seed_verification(device_id).await
    }
}
