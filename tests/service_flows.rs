use std::sync::Arc;
use std::time::Duration;

use keepkey_core::blocking_actions::BlockingActionType;
use keepkey_core::config::WatcherConfig;
use keepkey_core::messages::{FailureType, Message, PassphraseRequest, PinMatrixRequest, Success};
use keepkey_core::session::{PassphraseState, PinState, RecoveryState};
use keepkey_core::transport::mock::{mock_usb_device, MockDevice, MockTransportFactory};
use keepkey_core::usb_monitor::WatcherMessage;
use keepkey_core::{CoreConfig, DeviceError, DeviceEvent, KeepKeyService, SessionError, SessionKind};
use tokio::sync::broadcast;

fn config(fetch_on_connect: bool) -> CoreConfig {
    CoreConfig {
        watcher: WatcherConfig {
            fetch_features_on_connect: fetch_on_connect,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn service_with(device: &MockDevice, fetch_on_connect: bool) -> KeepKeyService {
    KeepKeyService::new(
        config(fetch_on_connect),
        Arc::new(MockTransportFactory::single(device.clone())),
    )
    .unwrap()
}

/// PIN 282, then a passphrase, then unlocked.
fn locked_device_with_passphrase() -> MockDevice {
    MockDevice::new(|msg| match msg {
        Message::Ping(_) => vec![PinMatrixRequest::default().into()],
        Message::PinMatrixAck(ack) if ack.pin == "282" => vec![PassphraseRequest::default().into()],
        Message::PinMatrixAck(_) => vec![MockDevice::failure(FailureType::FailurePinInvalid, "Invalid PIN")],
        Message::PassphraseAck(_) => vec![Success::default().into()],
        Message::Cancel(_) => vec![MockDevice::failure(FailureType::FailureActionCancelled, "Cancelled")],
        Message::GetFeatures(_) => vec![MockDevice::features().into()],
        _ => vec![],
    })
}

fn session_events(rx: &mut broadcast::Receiver<DeviceEvent>) -> Vec<String> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            DeviceEvent::SessionStarted { kind, .. } => seen.push(format!("started:{kind}")),
            DeviceEvent::SessionEnded { kind, .. } => seen.push(format!("ended:{kind}")),
            DeviceEvent::PinRequested { .. } => seen.push("pin".to_string()),
            DeviceEvent::PassphraseRequested { .. } => seen.push("passphrase".to_string()),
            _ => {}
        }
    }
    seen
}

async fn next_matching<F>(rx: &mut broadcast::Receiver<DeviceEvent>, mut pred: F) -> DeviceEvent
where
    F: FnMut(&DeviceEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event not seen in time")
}

#[tokio::test]
async fn wrong_pin_then_right_pin_then_passphrase() {
    let device = locked_device_with_passphrase();
    let service = service_with(&device, false);
    let mut events = service.subscribe();
    service
        .registry()
        .apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("AAA")));

    let pin = service.start_pin_unlock("AAA").await.unwrap();
    assert_eq!(pin.state, PinState::AwaitingPositions);
    assert_eq!(service.sessions().active_session("AAA"), Some((SessionKind::Pin, pin.session_id)));

    let wrong = service.send_pin_unlock_response(pin.session_id, &[1, 1, 1]).await.unwrap();
    assert!(!wrong.success);
    assert_eq!(wrong.error.as_deref(), Some("Invalid PIN"));

    let right = service.send_pin_unlock_response(pin.session_id, &[2, 8, 2]).await.unwrap();
    assert!(right.success);
    assert_eq!(right.next_step, Some(SessionKind::Passphrase));
    assert!(service.sessions().active_session("AAA").is_none());

    let passphrase = service.start_passphrase("AAA").await.unwrap();
    let accepted = service.send_passphrase(passphrase.session_id, "correct horse").await.unwrap();
    assert!(accepted.success);
    assert_eq!(accepted.next_step, None);

    // The wrong PIN costs a fresh Ping; the passphrase prompt is reused.
    assert_eq!(
        device.received_names(),
        vec!["Ping", "PinMatrixAck", "Ping", "PinMatrixAck", "PassphraseAck"]
    );
    assert_eq!(
        session_events(&mut events),
        vec!["started:pin", "pin", "ended:pin", "started:passphrase", "passphrase", "ended:passphrase"]
    );
}

#[tokio::test]
async fn passphrase_prompt_is_not_trusted_after_reconnect() {
    let device = locked_device_with_passphrase();
    let service = service_with(&device, false);
    let usb = mock_usb_device("AAA");
    service
        .registry()
        .apply_watcher_message(WatcherMessage::Arrived(usb.clone()));

    let pin = service.start_pin_unlock("AAA").await.unwrap();
    let right = service.send_pin_unlock_response(pin.session_id, &[2, 8, 2]).await.unwrap();
    assert_eq!(right.next_step, Some(SessionKind::Passphrase));

    // Replugged: the device boots locked again and the old prompt is gone.
    service.registry().apply_watcher_message(WatcherMessage::Left(usb.clone()));
    service.registry().apply_watcher_message(WatcherMessage::Arrived(usb));

    let passphrase = service.start_passphrase("AAA").await.unwrap();
    assert_eq!(passphrase.state, PassphraseState::Idle);
    assert_eq!(passphrase.next_step, Some(SessionKind::Pin));
    assert_eq!(device.received_names(), vec!["Ping", "PinMatrixAck", "Ping"]);
    assert!(service.sessions().active_session("AAA").is_none());
}

#[tokio::test]
async fn other_commands_invalidate_a_pending_prompt() {
    let device = locked_device_with_passphrase();
    let service = service_with(&device, false);
    service
        .registry()
        .apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("AAA")));

    let pin = service.start_pin_unlock("AAA").await.unwrap();
    service.send_pin_unlock_response(pin.session_id, &[2, 8, 2]).await.unwrap();
    service.refresh_features("AAA").await.unwrap();

    let passphrase = service.start_passphrase("AAA").await.unwrap();
    assert_eq!(passphrase.next_step, Some(SessionKind::Pin));
    assert_eq!(
        device.received_names(),
        vec!["Ping", "PinMatrixAck", "GetFeatures", "Ping"]
    );
}

#[tokio::test]
async fn feature_refresh_leaves_an_open_pin_session_alone() {
    let device = locked_device_with_passphrase();
    let service = service_with(&device, false);
    service
        .registry()
        .apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("AAA")));

    let cached = service.refresh_features("AAA").await.unwrap();
    let pin = service.start_pin_unlock("AAA").await.unwrap();

    let during = service.refresh_features("AAA").await.unwrap();
    assert_eq!(during, cached);
    assert_eq!(device.received_names(), vec!["GetFeatures", "Ping"]);

    let right = service.send_pin_unlock_response(pin.session_id, &[2, 8, 2]).await.unwrap();
    assert!(right.success);
}

#[tokio::test]
async fn feature_refresh_without_snapshot_is_refused_during_a_session() {
    let device = locked_device_with_passphrase();
    let service = service_with(&device, false);
    service
        .registry()
        .apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("AAA")));

    let pin = service.start_pin_unlock("AAA").await.unwrap();
    let err = service.get_device_features_by_id("AAA").await.unwrap_err();
    assert!(matches!(err, DeviceError::Busy { .. }));
    assert_eq!(err.code(), "KK-D06");
    assert_eq!(device.received_names(), vec!["Ping"]);

    let right = service.send_pin_unlock_response(pin.session_id, &[2, 8, 2]).await.unwrap();
    assert!(right.success);
}

#[tokio::test]
async fn cancelled_pin_session_frees_the_device() {
    let device = locked_device_with_passphrase();
    let service = service_with(&device, false);
    service
        .registry()
        .apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("AAA")));

    let first = service.start_pin_unlock("AAA").await.unwrap();
    let blocked = service.start_passphrase("AAA").await.unwrap_err();
    assert!(matches!(blocked, SessionError::AlreadyActive { .. }));

    assert!(service.cancel_pin_unlock(first.session_id).await.unwrap());
    let missing = service.send_pin_unlock_response(first.session_id, &[2, 8, 2]).await.unwrap_err();
    assert!(matches!(missing, SessionError::NotFound(_)));

    let second = service.start_pin_unlock("AAA").await.unwrap();
    assert_ne!(second.session_id, first.session_id);
    assert_eq!(second.state, PinState::AwaitingPositions);
}

#[tokio::test]
async fn seed_verification_walks_the_device_cursor() {
    use keepkey_core::messages::CharacterRequest;
    use std::sync::atomic::{AtomicU32, Ordering};

    let chars = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&chars);
    let device = MockDevice::new(move |msg| match msg {
        Message::RecoveryDevice(_) => vec![CharacterRequest { word_pos: 0, character_pos: 0 }.into()],
        Message::CharacterAck(ack) if ack.done == Some(true) => vec![Success {
            message: Some("Seed verified".into()),
        }
        .into()],
        Message::CharacterAck(_) => {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            // Four letters identify a word.
            vec![CharacterRequest {
                word_pos: n / 4,
                character_pos: n % 4,
            }
            .into()]
        }
        Message::GetFeatures(_) | Message::Initialize(_) => vec![MockDevice::features().into()],
        _ => vec![],
    });
    let service = service_with(&device, false);
    service
        .registry()
        .apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("AAA")));

    let started = service.start_seed_verification("AAA", 12).await.unwrap();
    assert_eq!(started.state, RecoveryState::AwaitingCharacter);
    assert_eq!((started.word_pos, started.character_pos), (0, 0));

    let mut last = None;
    for c in ["a", "b", "a", "n"] {
        last = Some(
            service
                .send_verification_character(started.session_id, Some(c), None)
                .await
                .unwrap(),
        );
    }
    let progress = last.unwrap();
    assert_eq!((progress.word_pos, progress.character_pos), (1, 0));
    assert!(progress.auto_completed);

    let done = service
        .send_verification_character(started.session_id, None, Some(keepkey_core::session::RecoveryAction::Done))
        .await
        .unwrap();
    assert!(done.is_complete);
    assert_eq!(done.state, RecoveryState::Verified);
    assert!(service.sessions().active_session("AAA").is_none());
}

#[tokio::test]
async fn reconnect_at_new_address_keeps_identity() {
    let device = MockDevice::keepkey();
    let service = service_with(&device, true);
    let mut events = service.subscribe();

    let first = mock_usb_device("SERIAL1");
    service
        .registry()
        .apply_watcher_message(WatcherMessage::Arrived(first.clone()));
    next_matching(&mut events, |e| matches!(e, DeviceEvent::DeviceUpdated { features: Some(_), .. })).await;

    let mut moved = first.clone();
    moved.address = moved.address.wrapping_add(7);
    service.registry().apply_watcher_message(WatcherMessage::Left(first));
    service.registry().apply_watcher_message(WatcherMessage::Arrived(moved));
    next_matching(&mut events, |e| matches!(e, DeviceEvent::DeviceConnected { .. })).await;

    let devices = service.list_connected_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].unique_id.as_str(), "SERIAL1");

    let features = service.get_device_features_by_id("SERIAL1").await.unwrap();
    assert_eq!(features.version, "7.10.0");
    assert!(service.highest_priority_action("SERIAL1").is_none());
}

#[tokio::test]
async fn uninitialized_device_is_gated_and_refuses_seed_verification() {
    let device = MockDevice::new(|msg| match msg {
        Message::GetFeatures(_) | Message::Initialize(_) => {
            let mut features = MockDevice::features();
            features.initialized = Some(false);
            vec![features.into()]
        }
        _ => vec![],
    });
    let service = service_with(&device, false);
    service
        .registry()
        .apply_watcher_message(WatcherMessage::Arrived(mock_usb_device("NEW1")));

    service.refresh_features("NEW1").await.unwrap();
    let action = service.highest_priority_action("NEW1").unwrap();
    assert_eq!(action.action_type, BlockingActionType::DeviceInitialization);

    let err = service.start_seed_verification("NEW1", 12).await.unwrap_err();
    assert!(matches!(err, SessionError::NotInitialized { .. }));
    assert!(service.resolve_blocking_action("NEW1", BlockingActionType::DeviceInitialization));
    assert!(service.highest_priority_action("NEW1").is_none());
}
