//! Event stream for subscribers (UI, server, CLI).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::device_queue::QueueStatus;
use crate::features::DeviceFeatures;
use crate::identity::FriendlyUsbDevice;
use crate::session::SessionKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceEvent {
    DeviceConnected {
        device_id: String,
        device: FriendlyUsbDevice,
    },
    DeviceDisconnected {
        device_id: String,
    },
    /// New features snapshot, or a failed fetch (`features: None`, `error` set).
    DeviceUpdated {
        device_id: String,
        features: Option<DeviceFeatures>,
        error: Option<String>,
    },
    QueueStatusChanged {
        status: QueueStatus,
    },
    BlockingActionsChanged {
        total: usize,
    },
    SessionStarted {
        device_id: String,
        session_id: Uuid,
        kind: SessionKind,
    },
    SessionEnded {
        device_id: String,
        session_id: Uuid,
        kind: SessionKind,
        outcome: String,
    },
    PinRequested {
        device_id: String,
        session_id: Uuid,
    },
    PassphraseRequested {
        device_id: String,
        session_id: Uuid,
    },
    CharacterRequested {
        device_id: String,
        session_id: Uuid,
        word_pos: u32,
        character_pos: u32,
    },
}

impl DeviceEvent {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DeviceEvent::DeviceConnected { device_id, .. }
            | DeviceEvent::DeviceDisconnected { device_id }
            | DeviceEvent::DeviceUpdated { device_id, .. }
            | DeviceEvent::SessionStarted { device_id, .. }
            | DeviceEvent::SessionEnded { device_id, .. }
            | DeviceEvent::PinRequested { device_id, .. }
            | DeviceEvent::PassphraseRequested { device_id, .. }
            | DeviceEvent::CharacterRequested { device_id, .. } => Some(device_id),
            DeviceEvent::QueueStatusChanged { status } => Some(&status.device_id),
            DeviceEvent::BlockingActionsChanged { .. } => None,
        }
    }
}

/// Event bus for broadcasting device events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeviceEvent>,
}

impl EventBus {
    /// Create a new event bus with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event
    pub fn emit(&self, event: DeviceEvent) {
        // Ignore send errors (no receivers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
