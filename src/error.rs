//! Error taxonomy for the device core.
//!
//! Transport failures are recovered by dropping and reopening the handle,
//! protocol failures point at a framing problem and are never retried, and
//! session failures carry the device-supplied detail so the calling layer can
//! render guidance.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::session::SessionKind;

/// Framing and decoding errors raised by the codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame too short: {len} bytes, header needs {needed}")]
    ShortFrame { len: usize, needed: usize },

    #[error("unexpected magic bytes: {found}")]
    UnexpectedMagic { found: String },

    #[error("packet must be {expected} bytes, got {actual}")]
    ShortPacket { expected: usize, actual: usize },

    #[error("continuation packet has marker 0x{found:02x}, expected 0x3f")]
    BadContinuation { found: u8 },

    #[error("declared length {declared} exceeds maximum {max}")]
    LengthTooLarge { declared: usize, max: usize },

    #[error("incomplete message: expected {expected} bytes, received {received}")]
    Incomplete { expected: usize, received: usize },

    #[error("packet received after message was complete")]
    UnexpectedPacket,

    #[error("failed to decode message type {message_type}: {reason}")]
    Decode { message_type: u16, reason: String },
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::ShortFrame { .. } => "KK-P01",
            ProtocolError::UnexpectedMagic { .. } => "KK-P02",
            ProtocolError::ShortPacket { .. } => "KK-P03",
            ProtocolError::BadContinuation { .. } => "KK-P04",
            ProtocolError::LengthTooLarge { .. } => "KK-P05",
            ProtocolError::Incomplete { .. } => "KK-P06",
            ProtocolError::UnexpectedPacket => "KK-P07",
            ProtocolError::Decode { .. } => "KK-P08",
        }
    }
}

/// Errors from the physical link (USB bulk endpoints or HID reports).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A platform driver or policy refused access to the interface.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The interface is claimed by another process.
    #[error("device busy or in use by another application: {0}")]
    Busy(String),

    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("device not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether dropping the handle and reopening may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TransportError::Busy(_)
                | TransportError::Disconnected(_)
                | TransportError::Timeout(_)
                | TransportError::Other(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            TransportError::PermissionDenied(_) => "KK-T01",
            TransportError::Busy(_) => "KK-T02",
            TransportError::Disconnected(_) => "KK-T03",
            TransportError::Timeout(_) => "KK-T04",
            TransportError::NotFound(_) => "KK-T05",
            TransportError::Other(_) => "KK-T99",
        }
    }

    /// Classify an error message by the wording platform libraries use.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("permission") || lower.contains("access denied") || lower.contains("not permitted") {
            TransportError::PermissionDenied(message)
        } else if lower.contains("in use")
            || lower.contains("busy")
            || lower.contains("claimed")
            || lower.contains("exclusive")
        {
            TransportError::Busy(message)
        } else if lower.contains("no such device") || lower.contains("disconnected") || lower.contains("not connected") {
            TransportError::Disconnected(message)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            TransportError::Timeout(Duration::ZERO)
        } else if lower.contains("not found") {
            TransportError::NotFound(message)
        } else if lower.contains("access") {
            TransportError::PermissionDenied(message)
        } else {
            TransportError::Other(message)
        }
    }
}

impl From<rusb::Error> for TransportError {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Access => TransportError::PermissionDenied(err.to_string()),
            rusb::Error::Busy => TransportError::Busy(err.to_string()),
            rusb::Error::NoDevice => TransportError::Disconnected(err.to_string()),
            rusb::Error::Timeout => TransportError::Timeout(Duration::ZERO),
            rusb::Error::NotFound => TransportError::NotFound(err.to_string()),
            other => TransportError::Other(other.to_string()),
        }
    }
}

/// Outcome of one frame exchange on an open link.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Queue-level errors. Every variant names the device and the attempted action.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{action} on {device_id} failed after {attempts} attempt(s): {source}")]
    Transport {
        device_id: String,
        action: String,
        attempts: u32,
        source: TransportError,
    },

    #[error("{action} on {device_id}: {source}")]
    Protocol {
        device_id: String,
        action: String,
        source: ProtocolError,
    },

    #[error("{action} on {device_id} timed out after {timeout:?}")]
    Timeout {
        device_id: String,
        action: String,
        timeout: Duration,
    },

    #[error("{action} on {device_id}: device reported failure: {message}")]
    Failure {
        device_id: String,
        action: String,
        code: Option<i32>,
        message: String,
    },

    #[error("{action} on {device_id}: unexpected response {received}")]
    UnexpectedResponse {
        device_id: String,
        action: String,
        received: String,
    },

    #[error("worker for {device_id} is unavailable")]
    WorkerUnavailable { device_id: String },

    #[error("device {device_id} not found")]
    NotFound { device_id: String },

    /// An interactive session owns the device and the command would disturb it.
    #[error("{action} on {device_id} refused while a session is active")]
    Busy { device_id: String, action: String },
}

impl DeviceError {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceError::Transport { device_id, .. }
            | DeviceError::Protocol { device_id, .. }
            | DeviceError::Timeout { device_id, .. }
            | DeviceError::Failure { device_id, .. }
            | DeviceError::UnexpectedResponse { device_id, .. }
            | DeviceError::WorkerUnavailable { device_id }
            | DeviceError::NotFound { device_id }
            | DeviceError::Busy { device_id, .. } => device_id,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            DeviceError::Transport { source, .. } => source.is_retriable(),
            DeviceError::Timeout { .. } => true,
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            DeviceError::Transport { source, .. } => source.code(),
            DeviceError::Protocol { source, .. } => source.code(),
            DeviceError::Timeout { .. } => "KK-D01",
            DeviceError::Failure { .. } => "KK-D02",
            DeviceError::UnexpectedResponse { .. } => "KK-D03",
            DeviceError::WorkerUnavailable { .. } => "KK-D04",
            DeviceError::NotFound { .. } => "KK-D05",
            DeviceError::Busy { .. } => "KK-D06",
        }
    }
}

/// Errors raised by the PIN, passphrase and recovery sessions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("a {kind} session is already active for {device_id}")]
    AlreadyActive { device_id: String, kind: SessionKind },

    #[error("session {session_id} cannot {action} while {state}")]
    InvalidState {
        session_id: Uuid,
        action: &'static str,
        state: String,
    },

    #[error("invalid PIN positions: {0}")]
    InvalidPositions(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Device-reported failure that ends the current attempt.
    #[error("device {device_id} reported failure: {message}")]
    DeviceFailure {
        device_id: String,
        code: Option<i32>,
        message: String,
    },

    #[error("session {0} was cancelled")]
    Cancelled(Uuid),

    #[error("device {device_id} is not initialized")]
    NotInitialized { device_id: String },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl SessionError {
    /// Whether the caller may clear its input and try again.
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::InvalidPositions(_) | SessionError::InvalidInput(_) => true,
            SessionError::Device(err) => err.is_retriable(),
            _ => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotFound(_) => "KK-S01",
            SessionError::AlreadyActive { .. } => "KK-S02",
            SessionError::InvalidState { .. } => "KK-S03",
            SessionError::InvalidPositions(_) => "KK-S04",
            SessionError::InvalidInput(_) => "KK-S05",
            SessionError::DeviceFailure { .. } => "KK-S06",
            SessionError::Cancelled(_) => "KK-S07",
            SessionError::NotInitialized { .. } => "KK-S08",
            SessionError::Device(err) => err.code(),
        }
    }
}

/// Errors loading configuration or the release manifest.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "KK-C01",
            ConfigError::Parse { .. } => "KK-C02",
            ConfigError::InvalidValue { .. } => "KK-C03",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rusb_errors_map_to_kinds() {
        assert!(matches!(
            TransportError::from(rusb::Error::Access),
            TransportError::PermissionDenied(_)
        ));
        assert!(matches!(TransportError::from(rusb::Error::Busy), TransportError::Busy(_)));
        assert!(matches!(
            TransportError::from(rusb::Error::NoDevice),
            TransportError::Disconnected(_)
        ));
        assert!(matches!(TransportError::from(rusb::Error::Timeout), TransportError::Timeout(_)));
        assert!(matches!(TransportError::from(rusb::Error::Pipe), TransportError::Other(_)));
    }

    #[test]
    fn hid_messages_are_classified() {
        assert!(matches!(
            TransportError::from_message("Failed to open device: Access denied"),
            TransportError::PermissionDenied(_)
        ));
        assert!(matches!(
            TransportError::from_message("device is claimed by another process"),
            TransportError::Busy(_)
        ));
        assert!(matches!(
            TransportError::from_message("hidapi: something odd"),
            TransportError::Other(_)
        ));
    }

    #[test]
    fn retriable_kinds() {
        assert!(TransportError::Disconnected("x".into()).is_retriable());
        assert!(TransportError::Busy("x".into()).is_retriable());
        assert!(!TransportError::PermissionDenied("x".into()).is_retriable());
        assert!(!TransportError::NotFound("x".into()).is_retriable());
    }

    #[test]
    fn device_errors_carry_context() {
        let err = DeviceError::Transport {
            device_id: "ABC123".into(),
            action: "GetFeatures".into(),
            attempts: 3,
            source: TransportError::Disconnected("gone".into()),
        };
        let text = err.to_string();
        assert!(text.contains("ABC123"));
        assert!(text.contains("GetFeatures"));
        assert!(text.contains("gone"));
        assert_eq!(err.device_id(), "ABC123");
        assert_eq!(err.code(), "KK-T03");
        assert!(err.is_retriable());
    }

    #[test]
    fn protocol_errors_are_not_retriable() {
        let err = DeviceError::Protocol {
            device_id: "d".into(),
            action: "Ping".into(),
            source: ProtocolError::Incomplete { expected: 10, received: 4 },
        };
        assert!(!err.is_retriable());
        assert_eq!(err.code(), "KK-P06");
    }

    #[test]
    fn session_error_recoverability() {
        assert!(SessionError::InvalidPositions("empty".into()).is_recoverable());
        assert!(!SessionError::NotFound(Uuid::nil()).is_recoverable());
        assert_eq!(
            SessionError::AlreadyActive { device_id: "d".into(), kind: SessionKind::Pin }.code(),
            "KK-S02"
        );
    }
}
