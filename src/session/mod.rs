//! Interactive PIN, passphrase and recovery flows.
//!
//! Every session talks to its device through the device's queue worker and
//! holds the device identity in the registry for as long as it lives. Session
//! state sits in concurrent maps whose guards are never held across device I/O.

pub mod passphrase;
pub mod pin;
pub mod recovery;

use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::device_registry::DeviceRegistry;
use crate::error::SessionError;
use crate::events::{DeviceEvent, EventBus};
use crate::identity::DeviceIdentity;
use crate::messages::{Cancel, Initialize, Message};

pub use passphrase::{PassphraseResult, PassphraseSessionInfo, PassphraseState};
pub use pin::{PinSessionInfo, PinState, PinUnlockResult};
pub use recovery::{RecoveryAction, RecoveryProgress, RecoverySessionInfo, RecoveryState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Pin,
    Passphrase,
    Recovery,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionKind::Pin => "pin",
            SessionKind::Passphrase => "passphrase",
            SessionKind::Recovery => "recovery",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ActiveSession {
    kind: SessionKind,
    session_id: Uuid,
}

/// Owns every interactive session in the process.
pub struct SessionManager {
    registry: DeviceRegistry,
    config: SessionConfig,
    // at most one interactive session per device
    active: DashMap<DeviceIdentity, ActiveSession>,
    pins: DashMap<Uuid, pin::PinSession>,
    passphrases: DashMap<Uuid, passphrase::PassphraseSession>,
    recoveries: DashMap<Uuid, recovery::RecoverySession>,
}

impl SessionManager {
    pub fn new(registry: DeviceRegistry, config: SessionConfig) -> Self {
        Self {
            registry,
            config,
            active: DashMap::new(),
            pins: DashMap::new(),
            passphrases: DashMap::new(),
            recoveries: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    fn events(&self) -> &EventBus {
        self.registry.events()
    }

    /// The session currently driving `device_id`, if any.
    pub fn active_session(&self, device_id: &str) -> Option<(SessionKind, Uuid)> {
        let id = self.registry.resolve_id(device_id);
        self.active.get(&id).map(|active| (active.kind, active.session_id))
    }

    fn claim(&self, device: &DeviceIdentity, kind: SessionKind, session_id: Uuid) -> Result<(), SessionError> {
        match self.active.entry(device.clone()) {
            Entry::Occupied(existing) => Err(SessionError::AlreadyActive {
                device_id: device.to_string(),
                kind: existing.get().kind,
            }),
            Entry::Vacant(slot) => {
                slot.insert(ActiveSession { kind, session_id });
                Ok(())
            }
        }
    }

    fn release_claim(&self, device: &DeviceIdentity, session_id: Uuid) {
        self.active.remove_if(device, |_, active| active.session_id == session_id);
    }

    fn set_prompt(&self, device: &DeviceIdentity, kind: SessionKind) {
        self.registry.set_pending_prompt(device, kind);
    }

    /// Whether the device already asked for `kind` and is still waiting.
    fn take_prompt(&self, device: &DeviceIdentity, kind: SessionKind) -> bool {
        self.registry.take_pending_prompt(device, kind)
    }

    /// One request through the device's queue worker.
    async fn exchange(&self, device: &DeviceIdentity, message: Message) -> Result<Message, SessionError> {
        let handle = self.registry.get_or_spawn_worker(device.as_str())?;
        Ok(handle.send_raw(message).await?)
    }

    /// Best-effort `Cancel` so the device drops whatever prompt it is showing.
    async fn send_cancel(&self, device: &DeviceIdentity) {
        self.registry.clear_pending_prompt(device);
        match self.exchange(device, Cancel {}.into()).await {
            Ok(response) => debug!("Cancel sent to {}: {}", device, response.name()),
            Err(e) => warn!("Failed to send Cancel to {}: {}", device, e),
        }
    }

    /// `Cancel` followed by `Initialize`, returning the device to its home screen.
    /// The worker's link stays open throughout.
    async fn reset_device_flow(&self, device: &DeviceIdentity) {
        self.send_cancel(device).await;
        match self.exchange(device, Initialize {}.into()).await {
            Ok(response) => debug!("Initialize sent to {}: {}", device, response.name()),
            Err(e) => warn!("Failed to re-initialize {}: {}", device, e),
        }
    }

    fn started(&self, device: &DeviceIdentity, session_id: Uuid, kind: SessionKind) {
        info!("Started {} session {} for {}", kind, session_id, device);
        self.events().emit(DeviceEvent::SessionStarted {
            device_id: device.to_string(),
            session_id,
            kind,
        });
    }

    fn ended(&self, device: &DeviceIdentity, session_id: Uuid, kind: SessionKind, outcome: &str) {
        info!("{} session {} for {} ended: {}", kind, session_id, device, outcome);
        self.release_claim(device, session_id);
        self.events().emit(DeviceEvent::SessionEnded {
            device_id: device.to_string(),
            session_id,
            kind,
            outcome: outcome.to_string(),
        });
    }
}

/// Encode scrambled-matrix positions the way `PinMatrixAck` carries them.
pub(crate) fn encode_positions(positions: &[u8]) -> Result<String, SessionError> {
    if positions.is_empty() || positions.len() > 9 {
        return Err(SessionError::InvalidPositions(format!(
            "expected 1 to 9 positions, got {}",
            positions.len()
        )));
    }
    if let Some(bad) = positions.iter().find(|p| !(1..=9).contains(*p)) {
        return Err(SessionError::InvalidPositions(format!("position {bad} is outside 1-9")));
    }
    Ok(positions.iter().map(|&p| char::from(b'0' + p)).collect())
}
