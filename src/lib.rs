//! Core, headless KeepKey library: framing, transports, per-device queues,
//! the device registry and the interactive PIN, passphrase and recovery flows.

pub mod blocking_actions;
pub mod codec;
pub mod config;
pub mod device_queue;
pub mod device_registry;
pub mod error;
pub mod events;
pub mod features;
pub mod identity;
pub mod messages;
pub mod service;
pub mod session;
pub mod transport;
pub mod updates;
pub mod usb_monitor;

pub use config::CoreConfig;
pub use device_queue::{DeviceQueueFactory, DeviceQueueHandle, QueueStatus};
pub use device_registry::DeviceRegistry;
pub use error::{ConfigError, DeviceError, LinkError, ProtocolError, SessionError, TransportError};
pub use events::{DeviceEvent, EventBus};
pub use identity::{DeviceIdentity, FriendlyUsbDevice};
pub use service::KeepKeyService;
pub use session::{SessionKind, SessionManager};
