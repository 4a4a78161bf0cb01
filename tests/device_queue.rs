use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use keepkey_core::config::QueueConfig;
use keepkey_core::messages::{Message, Ping};
use keepkey_core::transport::mock::{mock_usb_device, MockDevice, MockTransportFactory};
use keepkey_core::{DeviceError, DeviceQueueFactory, DeviceQueueHandle, TransportError};

fn spawn(device: &MockDevice) -> DeviceQueueHandle {
    DeviceQueueFactory::new(Arc::new(MockTransportFactory::single(device.clone())))
        .with_config(QueueConfig::default())
        .spawn_worker("QUEUE1".into(), mock_usb_device("QUEUE1"))
}

fn ping(text: String) -> Message {
    Ping {
        message: Some(text),
        ..Default::default()
    }
    .into()
}

#[tokio::test]
async fn concurrent_callers_are_serialized_on_one_link() {
    let device = MockDevice::keepkey();
    device.set_response_delay(Duration::from_millis(2));
    let handle = spawn(&device);

    let calls = (0..16).map(|i| {
        let handle = handle.clone();
        async move { (i, handle.send_raw(ping(format!("req-{i}"))).await) }
    });
    let results = join_all(calls).await;

    for (i, result) in results {
        match result {
            Ok(Message::Success(success)) => assert_eq!(success.message(), format!("req-{i}")),
            other => panic!("request {i} got {other:?}"),
        }
    }
    assert_eq!(device.received().len(), 16);
    assert_eq!(device.max_open_handles(), 1);
    assert_eq!(device.overlapping_requests(), 0);
    assert_eq!(device.opens(), 1);
}

#[tokio::test]
async fn commands_reach_the_device_in_submission_order() {
    let device = MockDevice::keepkey();
    device.set_response_delay(Duration::from_millis(2));
    let handle = spawn(&device);

    let mut tasks = Vec::new();
    for i in 0..16 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move { handle.send_raw(ping(format!("req-{i}"))).await }));
        // let this caller enqueue before the next one is created
        tokio::task::yield_now().await;
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let seen: Vec<String> = device
        .received()
        .into_iter()
        .map(|msg| match msg {
            Message::Ping(ping) => ping.message().to_string(),
            other => panic!("unexpected {}", other.name()),
        })
        .collect();
    let expected: Vec<String> = (0..16).map(|i| format!("req-{i}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn exhausted_retries_leave_the_queue_usable() {
    let device = MockDevice::keepkey();
    for _ in 0..3 {
        device.fail_next_write(TransportError::Disconnected("cable pulled".into()));
    }
    let handle = spawn(&device);

    let err = handle.send_raw(ping("lost".into())).await.unwrap_err();
    assert!(err.is_retriable());
    assert!(matches!(err, DeviceError::Transport { .. }));

    let features = handle.get_features().await.unwrap();
    assert_eq!(features.device_id(), "MOCKDEVICE0001");
    assert_eq!(device.opens(), 4);
    assert_eq!(device.open_handles(), 1);
}

#[tokio::test]
async fn truncated_reply_resets_and_next_command_succeeds() {
    let device = MockDevice::new(|msg| match msg {
        Message::GetFeatures(_) => vec![MockDevice::features().into()],
        _ => vec![],
    });
    let handle = DeviceQueueFactory::new(Arc::new(MockTransportFactory::single(device.clone())))
        .with_config(QueueConfig {
            operation_timeout_ms: 2_000,
            max_retries: 0,
            ..Default::default()
        })
        .spawn_worker("QUEUE1".into(), mock_usb_device("QUEUE1"));

    device.truncate_next_response();
    assert!(handle.get_features().await.is_err());

    let features = handle.get_features().await.unwrap();
    assert_eq!(features.label(), "Mock KeepKey");
}
