use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{DeviceError, LinkError, TransportError};
use crate::events::{DeviceEvent, EventBus};
use crate::identity::FriendlyUsbDevice;
use crate::messages::{FailureType, Features, FirmwareErase, FirmwareUpload, GetFeatures, Initialize, Message};
use crate::transport::{ProtocolAdapter, TransportFactory, UsbHidTransportFactory};

const METRICS_WINDOW: usize = 100;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
// Erase and flash both wait on the user confirming on the device.
const FIRMWARE_UPLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);
// Margin over the device read timeout before the caller gives up on a user-wait command.
const USER_WAIT_SLACK: Duration = Duration::from_secs(5);

type Reply<T> = oneshot::Sender<Result<T, DeviceError>>;
type DeviceLink = Box<dyn ProtocolAdapter + Send>;

/// Commands that can be sent to the device worker
#[derive(Debug)]
pub enum DeviceCmd {
    GetFeatures {
        respond_to: Reply<Features>,
        enqueued_at: Instant,
    },
    SendRaw {
        request_id: Uuid,
        message: Message,
        respond_to: Reply<Message>,
        enqueued_at: Instant,
    },
    /// Erase and flash, then drop the link regardless of outcome.
    FirmwareUpload {
        payload: Vec<u8>,
        respond_to: Reply<()>,
        enqueued_at: Instant,
    },
    ResetTransport {
        respond_to: Reply<()>,
        enqueued_at: Instant,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

impl DeviceCmd {
    fn enqueued_at(&self) -> Instant {
        match self {
            DeviceCmd::GetFeatures { enqueued_at, .. }
            | DeviceCmd::SendRaw { enqueued_at, .. }
            | DeviceCmd::FirmwareUpload { enqueued_at, .. }
            | DeviceCmd::ResetTransport { enqueued_at, .. } => *enqueued_at,
            DeviceCmd::Shutdown { .. } => Instant::now(),
        }
    }

    fn operation_name(&self) -> &'static str {
        match self {
            DeviceCmd::GetFeatures { .. } => "GetFeatures",
            DeviceCmd::SendRaw { message, .. } => message.name(),
            DeviceCmd::FirmwareUpload { .. } => "FirmwareUpload",
            DeviceCmd::ResetTransport { .. } => "ResetTransport",
            DeviceCmd::Shutdown { .. } => "Shutdown",
        }
    }
}

/// Metrics for monitoring queue performance
#[derive(Debug, Default, Clone)]
pub struct DeviceQueueMetrics {
    pub queue_wait_ms: VecDeque<u64>,
    pub device_rtt_ms: VecDeque<u64>,
    pub total_ms: VecDeque<u64>,
    pub operations: u64,
    pub failures: u64,
}

impl DeviceQueueMetrics {
    pub fn record_operation(&mut self, queue_wait: Duration, device_rtt: Duration, total: Duration, ok: bool) {
        self.operations += 1;
        if !ok {
            self.failures += 1;
        }
        self.queue_wait_ms.push_back(queue_wait.as_millis() as u64);
        self.device_rtt_ms.push_back(device_rtt.as_millis() as u64);
        self.total_ms.push_back(total.as_millis() as u64);

        // Keep only last 100 measurements
        while self.queue_wait_ms.len() > METRICS_WINDOW {
            self.queue_wait_ms.pop_front();
            self.device_rtt_ms.pop_front();
            self.total_ms.pop_front();
        }
    }

    pub fn avg_queue_wait_ms(&self) -> Option<u64> {
        average(&self.queue_wait_ms)
    }

    pub fn avg_device_rtt_ms(&self) -> Option<u64> {
        average(&self.device_rtt_ms)
    }
}

fn average(samples: &VecDeque<u64>) -> Option<u64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<u64>() / samples.len() as u64)
    }
}

/// Outcome of the most recently finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastResponse {
    pub operation: String,
    /// Response message name, or the error text.
    pub outcome: String,
    pub ok: bool,
    pub elapsed_ms: u64,
}

/// Queue introspection for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub device_id: String,
    pub queue_length: usize,
    pub processing: bool,
    pub last_response: Option<LastResponse>,
    pub avg_queue_wait_ms: Option<u64>,
    pub avg_device_rtt_ms: Option<u64>,
}

impl QueueStatus {
    pub fn idle(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            queue_length: 0,
            processing: false,
            last_response: None,
            avg_queue_wait_ms: None,
            avg_device_rtt_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct WorkerState {
    processing: bool,
    last_response: Option<LastResponse>,
    avg_queue_wait_ms: Option<u64>,
    avg_device_rtt_ms: Option<u64>,
}

fn queue_status(device_id: &str, pending: &AtomicUsize, state: &WorkerState) -> QueueStatus {
    QueueStatus {
        device_id: device_id.to_string(),
        queue_length: pending.load(Ordering::SeqCst),
        processing: state.processing,
        last_response: state.last_response.clone(),
        avg_queue_wait_ms: state.avg_queue_wait_ms,
        avg_device_rtt_ms: state.avg_device_rtt_ms,
    }
}

/// Worker task that owns the device link and processes commands one at a time.
pub struct DeviceWorker {
    device_id: String,
    device_info: watch::Receiver<FriendlyUsbDevice>,
    transports: Arc<dyn TransportFactory>,
    transport: Option<DeviceLink>,
    config: QueueConfig,
    metrics: DeviceQueueMetrics,
    cmd_rx: mpsc::Receiver<DeviceCmd>,
    pending: Arc<AtomicUsize>,
    state_tx: watch::Sender<WorkerState>,
    events: Option<EventBus>,
}

impl DeviceWorker {
    /// Main worker loop - processes commands sequentially
    #[instrument(level = "info", skip(self), fields(device_id = %self.device_id))]
    pub async fn run(mut self) {
        info!("🚀 DeviceWorker starting for device {}", self.device_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let cmd = match cmd {
                DeviceCmd::Shutdown { respond_to } => {
                    let _ = respond_to.send(());
                    break;
                }
                other => other,
            };

            let enqueued_at = cmd.enqueued_at();
            let started = Instant::now();
            let operation = cmd.operation_name();
            debug!("📝 Processing {} (queue wait: {:?})", operation, started.duration_since(enqueued_at));

            self.publish(|state| state.processing = true);
            let (outcome, ok) = self.process_command(cmd).await;
            if !ok {
                error!("❌ {} failed on {}: {}", operation, self.device_id, outcome);
            }

            self.metrics
                .record_operation(started.duration_since(enqueued_at), started.elapsed(), enqueued_at.elapsed(), ok);
            let last = LastResponse {
                operation: operation.to_string(),
                outcome,
                ok,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            let (avg_wait, avg_rtt) = (self.metrics.avg_queue_wait_ms(), self.metrics.avg_device_rtt_ms());
            self.publish(|state| {
                state.processing = false;
                state.last_response = Some(last);
                state.avg_queue_wait_ms = avg_wait;
                state.avg_device_rtt_ms = avg_rtt;
            });
        }

        self.transport = None;
        info!("🛑 DeviceWorker shutting down for device {}", self.device_id);
    }

    fn publish(&self, update: impl FnOnce(&mut WorkerState)) {
        let mut state = self.state_tx.borrow().clone();
        update(&mut state);
        let status = queue_status(&self.device_id, &self.pending, &state);
        self.state_tx.send_replace(state);
        if let Some(events) = &self.events {
            events.emit(DeviceEvent::QueueStatusChanged { status });
        }
    }

    async fn process_command(&mut self, cmd: DeviceCmd) -> (String, bool) {
        match cmd {
            DeviceCmd::GetFeatures { respond_to, .. } => {
                let result = self.handle_get_features().await;
                let summary = summarize(&result, |_| "Features".to_string());
                let _ = respond_to.send(result);
                summary
            }
            DeviceCmd::SendRaw {
                request_id,
                message,
                respond_to,
                ..
            } => {
                debug!("request {} -> {}", request_id, message.name());
                let result = self.execute(message).await;
                let summary = summarize(&result, |response| response.name().to_string());
                let _ = respond_to.send(result);
                summary
            }
            DeviceCmd::FirmwareUpload { payload, respond_to, .. } => {
                let result = self.flash(payload).await;
                self.drop_transport("firmware upload finished");
                let summary = summarize(&result, |_| "Success".to_string());
                let _ = respond_to.send(result);
                summary
            }
            DeviceCmd::ResetTransport { respond_to, .. } => {
                self.drop_transport("reset requested");
                let _ = respond_to.send(Ok(()));
                ("Success".to_string(), true)
            }
            DeviceCmd::Shutdown { respond_to } => {
                let _ = respond_to.send(());
                ("Shutdown".to_string(), true)
            }
        }
    }

    fn drop_transport(&mut self, reason: &str) {
        if self.transport.take().is_some() {
            info!("🔌 Dropped transport for device {}: {}", self.device_id, reason);
        }
    }

    /// Run one request against the device, reopening the link after
    /// retriable transport errors up to `max_retries` times.
    async fn execute(&mut self, message: Message) -> Result<Message, DeviceError> {
        let action = message.name();
        // A user-wait command that timed out may still be on the device screen.
        let may_retry = !message.awaits_user();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let transport = self.transport.take();
            let transports = Arc::clone(&self.transports);
            let device = self.device_info.borrow().clone();
            let request = message.clone();

            let (transport, result) =
                match tokio::task::spawn_blocking(move || exchange(transports.as_ref(), &device, transport, request))
                    .await
                {
                    Ok(pair) => pair,
                    Err(join_err) => (
                        None,
                        Err(TransportError::Other(format!("device I/O task failed: {join_err}")).into()),
                    ),
                };
            self.transport = transport;

            match result {
                Ok(response) => return Ok(response),
                Err(LinkError::Protocol(source)) => {
                    warn!("⚠️ {} on {}: protocol error: {}", action, self.device_id, source);
                    return Err(DeviceError::Protocol {
                        device_id: self.device_id.clone(),
                        action: action.to_string(),
                        source,
                    });
                }
                Err(LinkError::Transport(source)) => {
                    warn!(
                        "⚠️ {} on {}: transport error on attempt {}: {}",
                        action, self.device_id, attempts, source
                    );
                    if may_retry && source.is_retriable() && attempts <= self.config.max_retries {
                        continue;
                    }
                    return Err(DeviceError::Transport {
                        device_id: self.device_id.clone(),
                        action: action.to_string(),
                        attempts,
                        source,
                    });
                }
            }
        }
    }

    /// GetFeatures, falling back to Initialize for firmware that rejects it.
    async fn handle_get_features(&mut self) -> Result<Features, DeviceError> {
        let response = match self.execute(GetFeatures {}.into()).await? {
            Message::Features(features) => return Ok(features),
            Message::Failure(failure)
                if failure.failure_type() == Some(FailureType::FailureUnexpectedMessage)
                    || failure.message().contains("Unknown message") =>
            {
                info!("GetFeatures rejected by {}, falling back to Initialize", self.device_id);
                self.execute(Initialize {}.into()).await?
            }
            Message::Unknown { message_type, .. } => {
                info!("GetFeatures answered with unknown type {} by {}, falling back to Initialize", message_type, self.device_id);
                self.execute(Initialize {}.into()).await?
            }
            other => other,
        };
        match response {
            Message::Features(features) => Ok(features),
            other => Err(self.unexpected("GetFeatures", other)),
        }
    }

    async fn flash(&mut self, payload: Vec<u8>) -> Result<(), DeviceError> {
        match self.execute(FirmwareErase {}.into()).await? {
            Message::Success(_) => {}
            other => return Err(self.unexpected("FirmwareErase", other)),
        }

        let payload_hash = Sha256::digest(&payload).to_vec();
        info!(
            "Uploading {} bytes to {} (sha256 {})",
            payload.len(),
            self.device_id,
            hex::encode(&payload_hash)
        );
        let upload = FirmwareUpload {
            payload_hash: Some(payload_hash),
            payload,
        };
        match self.execute(upload.into()).await? {
            Message::Success(_) => Ok(()),
            other => Err(self.unexpected("FirmwareUpload", other)),
        }
    }

    fn unexpected(&self, action: &str, response: Message) -> DeviceError {
        match response {
            Message::Failure(failure) => DeviceError::Failure {
                device_id: self.device_id.clone(),
                action: action.to_string(),
                code: failure.code,
                message: failure.message().to_string(),
            },
            other => DeviceError::UnexpectedResponse {
                device_id: self.device_id.clone(),
                action: action.to_string(),
                received: other.name().to_string(),
            },
        }
    }
}

/// One request/response on the device link, opening it first if needed.
/// Returns the link when it is still usable.
fn exchange(
    transports: &dyn TransportFactory,
    device: &FriendlyUsbDevice,
    transport: Option<DeviceLink>,
    request: Message,
) -> (Option<DeviceLink>, Result<Message, LinkError>) {
    let mut transport = match transport {
        Some(transport) => transport,
        None => {
            info!("🔗 Creating transport for device {}", device.unique_id);
            match transports.open(device) {
                Ok(transport) => transport,
                Err(err) => return (None, Err(err.into())),
            }
        }
    };

    let result = transport.with_interaction_handler().handle(request);
    let keep_link = match &result {
        Ok(_) => true,
        // Leftover packets of the bad reply are drained; the link stays open.
        Err(LinkError::Protocol(_)) => match transport.reset() {
            Ok(()) => true,
            Err(err) => {
                warn!("Flush after protocol error failed for {}: {}", device.unique_id, err);
                false
            }
        },
        Err(LinkError::Transport(_)) => false,
    };
    (keep_link.then_some(transport), result)
}

fn summarize<T>(result: &Result<T, DeviceError>, describe: impl FnOnce(&T) -> String) -> (String, bool) {
    match result {
        Ok(value) => (describe(value), true),
        Err(err) => (err.to_string(), false),
    }
}

/// Handle for communicating with a device worker
#[derive(Clone, Debug)]
pub struct DeviceQueueHandle {
    device_id: String,
    cmd_tx: mpsc::Sender<DeviceCmd>,
    pending: Arc<AtomicUsize>,
    state_rx: watch::Receiver<WorkerState>,
    device_info: Arc<watch::Sender<FriendlyUsbDevice>>,
    operation_timeout: Duration,
}

impl DeviceQueueHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the worker is still accepting commands.
    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    pub fn device_info(&self) -> FriendlyUsbDevice {
        self.device_info.borrow().clone()
    }

    /// Point the worker at a re-enumerated device. Takes effect on the next open.
    pub fn update_device_info(&self, device: FriendlyUsbDevice) {
        self.device_info.send_replace(device);
    }

    pub fn status(&self) -> QueueStatus {
        queue_status(&self.device_id, &self.pending, &self.state_rx.borrow())
    }

    async fn enqueue(&self, cmd: DeviceCmd) -> Result<(), DeviceError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.cmd_tx.send(cmd).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DeviceError::WorkerUnavailable {
                device_id: self.device_id.clone(),
            });
        }
        Ok(())
    }

    async fn dispatch<T>(
        &self,
        action: &str,
        wait: Duration,
        build: impl FnOnce(Reply<T>) -> DeviceCmd,
    ) -> Result<T, DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(build(tx)).await?;
        match timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::WorkerUnavailable {
                device_id: self.device_id.clone(),
            }),
            Err(_) => Err(DeviceError::Timeout {
                device_id: self.device_id.clone(),
                action: action.to_string(),
                timeout: wait,
            }),
        }
    }

    fn timeout_for(&self, message: &Message) -> Duration {
        if message.awaits_user() {
            let legacy = self.device_info.borrow().is_legacy_hid();
            self.operation_timeout.max(message.read_timeout(legacy) + USER_WAIT_SLACK)
        } else {
            self.operation_timeout
        }
    }

    #[instrument(level = "debug", skip(self), fields(device_id = %self.device_id))]
    pub async fn get_features(&self) -> Result<Features, DeviceError> {
        self.dispatch("GetFeatures", self.operation_timeout, |respond_to| DeviceCmd::GetFeatures {
            respond_to,
            enqueued_at: Instant::now(),
        })
        .await
    }

    /// Send any message and return the device's final response.
    /// Button and entropy prompts are answered by the worker.
    #[instrument(level = "debug", skip(self, message), fields(device_id = %self.device_id, message = message.name()))]
    pub async fn send_raw(&self, message: Message) -> Result<Message, DeviceError> {
        let wait = self.timeout_for(&message);
        let action = message.name();
        self.dispatch(action, wait, |respond_to| DeviceCmd::SendRaw {
            request_id: Uuid::new_v4(),
            message,
            respond_to,
            enqueued_at: Instant::now(),
        })
        .await
    }

    #[instrument(level = "info", skip(self, payload), fields(device_id = %self.device_id, bytes = payload.len()))]
    pub async fn firmware_upload(&self, payload: Vec<u8>) -> Result<(), DeviceError> {
        self.dispatch("FirmwareUpload", FIRMWARE_UPLOAD_TIMEOUT, |respond_to| DeviceCmd::FirmwareUpload {
            payload,
            respond_to,
            enqueued_at: Instant::now(),
        })
        .await
    }

    /// Drop the worker's link; the next command opens a fresh one.
    pub async fn reset_transport(&self) -> Result<(), DeviceError> {
        self.dispatch("ResetTransport", self.operation_timeout, |respond_to| DeviceCmd::ResetTransport {
            respond_to,
            enqueued_at: Instant::now(),
        })
        .await
    }

    /// Shutdown the device worker
    pub async fn shutdown(&self) -> Result<(), DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(DeviceCmd::Shutdown { respond_to: tx }).await?;
        match timeout(SHUTDOWN_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeviceError::WorkerUnavailable {
                device_id: self.device_id.clone(),
            }),
            Err(_) => Err(DeviceError::Timeout {
                device_id: self.device_id.clone(),
                action: "Shutdown".to_string(),
                timeout: SHUTDOWN_TIMEOUT,
            }),
        }
    }
}

/// Factory for creating device workers and handles
#[derive(Clone)]
pub struct DeviceQueueFactory {
    transports: Arc<dyn TransportFactory>,
    config: QueueConfig,
    events: Option<EventBus>,
}

impl DeviceQueueFactory {
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            transports,
            config: QueueConfig::default(),
            events: None,
        }
    }

    /// Real hardware over WebUSB with HID fallback.
    pub fn usb() -> Self {
        Self::new(Arc::new(UsbHidTransportFactory::new()))
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Spawn a new device worker and return a handle to it
    pub fn spawn_worker(&self, device_id: String, device_info: FriendlyUsbDevice) -> DeviceQueueHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (info_tx, info_rx) = watch::channel(device_info);
        let (state_tx, state_rx) = watch::channel(WorkerState::default());
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = DeviceWorker {
            device_id: device_id.clone(),
            device_info: info_rx,
            transports: Arc::clone(&self.transports),
            transport: None,
            config: self.config.clone(),
            metrics: DeviceQueueMetrics::default(),
            cmd_rx,
            pending: Arc::clone(&pending),
            state_tx,
            events: self.events.clone(),
        };

        // Spawn the worker task
        tokio::spawn(worker.run());

        DeviceQueueHandle {
            device_id,
            cmd_tx,
            pending,
            state_rx,
            device_info: Arc::new(info_tx),
            operation_timeout: self.config.operation_timeout(),
        }
    }
}
