//! Gating actions that must be dealt with before a device is usable.
//!
//! Actions live in one ordered set keyed by `(device_id, action_type)`.
//! `BlockingActionType` orders highest priority first, so the first entry
//! in a device's range is the one to surface.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{DeviceEvent, EventBus};

/// Declaration order is priority order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockingActionType {
    DeviceCommunicationFailure,
    MandatoryBootloaderUpdate,
    DeviceInitialization,
    FirmwareUpdate,
}

impl BlockingActionType {
    const HIGHEST: Self = BlockingActionType::DeviceCommunicationFailure;
    const LOWEST: Self = BlockingActionType::FirmwareUpdate;

    /// Higher number = higher priority
    pub fn priority(self) -> u8 {
        match self {
            BlockingActionType::DeviceCommunicationFailure => 110,
            BlockingActionType::MandatoryBootloaderUpdate => 100,
            BlockingActionType::DeviceInitialization => 80,
            BlockingActionType::FirmwareUpdate => 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockingAction {
    pub device_id: String,
    pub action_type: BlockingActionType,
    /// Short human-readable reason; the front end owns the wording it shows.
    pub message: String,
    pub priority: u8,
    pub current_version: Option<String>,
    pub required_version: Option<String>,
}

impl BlockingAction {
    fn build(
        device_id: &str,
        action_type: BlockingActionType,
        message: String,
        versions: Option<(&str, &str)>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            action_type,
            message,
            priority: action_type.priority(),
            current_version: versions.map(|(current, _)| current.to_string()),
            required_version: versions.map(|(_, required)| required.to_string()),
        }
    }

    pub fn new_bootloader_update(device_id: &str, current: &str, required: &str) -> Self {
        Self::build(
            device_id,
            BlockingActionType::MandatoryBootloaderUpdate,
            format!("bootloader {current} must be updated to {required}"),
            Some((current, required)),
        )
    }

    pub fn new_firmware_update(device_id: &str, current: &str, target: &str) -> Self {
        Self::build(
            device_id,
            BlockingActionType::FirmwareUpdate,
            format!("firmware {current} can be updated to {target}"),
            Some((current, target)),
        )
    }

    pub fn new_device_initialization(device_id: &str) -> Self {
        Self::build(
            device_id,
            BlockingActionType::DeviceInitialization,
            "device has no seed yet".to_string(),
            None,
        )
    }

    pub fn new_communication_failure(device_id: &str, detail: &str) -> Self {
        Self::build(
            device_id,
            BlockingActionType::DeviceCommunicationFailure,
            format!("no response from device: {detail}"),
            None,
        )
    }
}

type ActionKey = (String, BlockingActionType);

#[derive(Clone)]
struct Publisher(EventBus);

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventBus")
    }
}

/// Shared, internally synchronized set of pending actions.
///
/// The lock is private and held for one set operation at a time, never
/// across device I/O. `BlockingActionsChanged` is emitted when the total
/// changes.
#[derive(Debug, Clone, Default)]
pub struct BlockingActionsState {
    actions: Arc<Mutex<BTreeMap<ActionKey, BlockingAction>>>,
    events: Option<Publisher>,
}

fn device_range<'a>(
    actions: &'a BTreeMap<ActionKey, BlockingAction>,
    device_id: &str,
) -> impl Iterator<Item = &'a BlockingAction> {
    let lo = (device_id.to_string(), BlockingActionType::HIGHEST);
    let hi = (device_id.to_string(), BlockingActionType::LOWEST);
    actions.range(lo..=hi).map(|(_, action)| action)
}

impl BlockingActionsState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: EventBus) -> Self {
        Self {
            actions: Arc::default(),
            events: Some(Publisher(events)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ActionKey, BlockingAction>> {
        match self.actions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut BTreeMap<ActionKey, BlockingAction>) -> R) -> R {
        let (result, before, after) = {
            let mut actions = self.lock();
            let before = actions.len();
            let result = f(&mut actions);
            (result, before, actions.len())
        };
        if before != after {
            debug!("blocking actions: {} -> {}", before, after);
            if let Some(Publisher(events)) = &self.events {
                events.emit(DeviceEvent::BlockingActionsChanged { total: after });
            }
        }
        result
    }

    /// Insert `action`, replacing one of the same type for the same device.
    pub fn add_action(&self, action: BlockingAction) {
        self.mutate(|actions| {
            actions.insert((action.device_id.clone(), action.action_type), action);
        });
    }

    /// Make `actions` the complete set for `device_id`.
    pub fn replace_for_device(&self, device_id: &str, replacement: Vec<BlockingAction>) {
        self.mutate(|actions| {
            actions.retain(|(device, _), _| device != device_id);
            for action in replacement {
                actions.insert((device_id.to_string(), action.action_type), action);
            }
        });
    }

    /// Idempotent: resolving an absent action returns `false` and changes nothing.
    pub fn resolve(&self, device_id: &str, action_type: BlockingActionType) -> bool {
        self.mutate(|actions| actions.remove(&(device_id.to_string(), action_type)).is_some())
    }

    pub fn clear_device(&self, device_id: &str) -> usize {
        self.mutate(|actions| {
            let before = actions.len();
            actions.retain(|(device, _), _| device != device_id);
            before - actions.len()
        })
    }

    pub fn highest_priority_action(&self, device_id: &str) -> Option<BlockingAction> {
        device_range(&self.lock(), device_id).next().cloned()
    }

    /// Highest priority first.
    pub fn actions_for_device(&self, device_id: &str) -> Vec<BlockingAction> {
        device_range(&self.lock(), device_id).cloned().collect()
    }

    pub fn all_actions(&self) -> Vec<BlockingAction> {
        self.lock().values().cloned().collect()
    }

    pub fn has_blocking_actions(&self, device_id: &str) -> bool {
        device_range(&self.lock(), device_id).next().is_some()
    }

    pub fn total_action_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highest_priority_wins_until_resolved() {
        let state = BlockingActionsState::new();
        state.add_action(BlockingAction::new_firmware_update("kk1", "7.9.0", "7.10.0"));
        state.add_action(BlockingAction::new_communication_failure("kk1", "timeout"));
        state.add_action(BlockingAction::new_bootloader_update("kk1", "1.0.3", "2.1.4"));

        let top = state.highest_priority_action("kk1").unwrap();
        assert_eq!(top.priority, 110);
        assert_eq!(top.action_type, BlockingActionType::DeviceCommunicationFailure);

        assert!(state.resolve("kk1", BlockingActionType::DeviceCommunicationFailure));
        assert_eq!(state.highest_priority_action("kk1").unwrap().priority, 100);

        assert!(state.resolve("kk1", BlockingActionType::MandatoryBootloaderUpdate));
        assert_eq!(state.highest_priority_action("kk1").unwrap().priority, 50);

        assert!(state.resolve("kk1", BlockingActionType::FirmwareUpdate));
        assert!(state.highest_priority_action("kk1").is_none());
    }

    #[test]
    fn initialization_sits_between_bootloader_and_firmware() {
        let state = BlockingActionsState::new();
        state.add_action(BlockingAction::new_firmware_update("kk", "7.0.0", "7.10.0"));
        state.add_action(BlockingAction::new_device_initialization("kk"));
        state.add_action(BlockingAction::new_bootloader_update("kk", "1.0.0", "2.1.4"));
        let order: Vec<u8> = state.actions_for_device("kk").iter().map(|a| a.priority).collect();
        assert_eq!(order, vec![100, 80, 50]);
    }

    #[test]
    fn devices_do_not_see_each_others_actions() {
        let state = BlockingActionsState::new();
        state.add_action(BlockingAction::new_device_initialization("kk"));
        state.add_action(BlockingAction::new_communication_failure("kk2", "busy"));
        state.add_action(BlockingAction::new_firmware_update("k", "7.0.0", "7.10.0"));

        assert_eq!(state.actions_for_device("kk").len(), 1);
        assert_eq!(
            state.highest_priority_action("kk").unwrap().action_type,
            BlockingActionType::DeviceInitialization
        );
        assert_eq!(state.clear_device("kk2"), 1);
        assert_eq!(state.total_action_count(), 2);
    }

    #[test]
    fn resolving_absent_action_is_a_noop() {
        let state = BlockingActionsState::new();
        assert!(!state.resolve("nobody", BlockingActionType::FirmwareUpdate));
        state.add_action(BlockingAction::new_device_initialization("kk"));
        assert!(!state.resolve("kk", BlockingActionType::FirmwareUpdate));
        assert_eq!(state.total_action_count(), 1);
    }

    #[test]
    fn same_type_replaces_existing() {
        let state = BlockingActionsState::new();
        state.add_action(BlockingAction::new_firmware_update("kk", "7.0.0", "7.9.0"));
        state.add_action(BlockingAction::new_firmware_update("kk", "7.0.0", "7.10.0"));
        let actions = state.actions_for_device("kk");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].required_version.as_deref(), Some("7.10.0"));
    }

    #[test]
    fn action_types_serialize_snake_case() {
        let json = serde_json::to_string(&BlockingActionType::MandatoryBootloaderUpdate).unwrap();
        assert_eq!(json, "\"mandatory_bootloader_update\"");
    }

    #[tokio::test]
    async fn count_changes_are_published() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let state = BlockingActionsState::with_events(bus);

        state.add_action(BlockingAction::new_device_initialization("kk"));
        state.add_action(BlockingAction::new_device_initialization("kk"));
        state.resolve("kk", BlockingActionType::DeviceInitialization);

        let totals: Vec<usize> = std::iter::from_fn(|| match rx.try_recv() {
            Ok(DeviceEvent::BlockingActionsChanged { total }) => Some(total),
            _ => None,
        })
        .collect();
        assert_eq!(totals, vec![1, 0]);
    }
}
