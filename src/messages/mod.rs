mod macros;
mod protos;
mod timeouts;

pub use protos::*;

use macros::kk_message;

use crate::codec::WireMessage;
use crate::error::ProtocolError;

kk_message!(
    // Session and device info
    Initialize = 0,
    Ping = 1,
    Success = 2,
    Failure = 3,
    Features = 17,
    GetFeatures = 55,
    ClearSession = 24,
    Cancel = 20,

    // Firmware and bootloader
    FirmwareErase = 6,
    FirmwareUpload = 7,

    // PIN and passphrase
    PinMatrixRequest = 18,
    PinMatrixAck = 19,
    PassphraseRequest = 41,
    PassphraseAck = 42,

    // User interaction
    ButtonRequest = 26,
    ButtonAck = 27,
    EntropyRequest = 35,
    EntropyAck = 36,

    // Recovery
    RecoveryDevice = 45,
    CharacterRequest = 80,
    CharacterAck = 81,
);

impl Message {
    /// Canonical `##` frame for this message.
    pub fn to_frame(&self) -> Vec<u8> {
        self.to_wire().to_frame()
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        Message::from_wire(&WireMessage::from_frame(frame)?)
    }
}

impl Failure {
    pub fn failure_type(&self) -> Option<FailureType> {
        self.code.and_then(FailureType::from_i32)
    }
}
