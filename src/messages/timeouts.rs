use super::Message;
use core::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(5000);
// Waits on a human: button press, PIN, passphrase, recovery characters, flashing.
const LONG_TIMEOUT: Duration = Duration::from_millis(5 * 60 * 1000);
// PID 0x0001 devices answer noticeably slower over HID.
const LEGACY_DEVICE_TIMEOUT: Duration = Duration::from_millis(10000);

impl Message {
    /// Whether the device's reply to this message waits on the user.
    pub fn awaits_user(&self) -> bool {
        matches!(
            self,
            Message::ButtonAck(_)
                | Message::PinMatrixAck(_)
                | Message::PassphraseAck(_)
                | Message::CharacterAck(_)
                | Message::FirmwareErase(_)
                | Message::FirmwareUpload(_)
        )
    }

    pub fn read_timeout(&self, legacy_device: bool) -> Duration {
        match self {
            _ if self.awaits_user() => LONG_TIMEOUT,
            _ if legacy_device => LEGACY_DEVICE_TIMEOUT,
            _ => TIMEOUT,
        }
    }

    pub fn write_timeout(&self, legacy_device: bool) -> Duration {
        match self {
            Message::FirmwareUpload(_) => LONG_TIMEOUT,
            _ if legacy_device => LEGACY_DEVICE_TIMEOUT,
            _ => TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ButtonAck, GetFeatures, Initialize, PinMatrixAck};

    #[test]
    fn user_waits_get_long_timeouts() {
        assert_eq!(Message::from(ButtonAck {}).read_timeout(false), LONG_TIMEOUT);
        assert_eq!(
            Message::from(PinMatrixAck { pin: "123".into() }).read_timeout(true),
            LONG_TIMEOUT
        );
    }

    #[test]
    fn legacy_devices_get_longer_default() {
        assert_eq!(Message::from(Initialize {}).read_timeout(false), TIMEOUT);
        assert_eq!(Message::from(Initialize {}).read_timeout(true), LEGACY_DEVICE_TIMEOUT);
        assert_eq!(Message::from(GetFeatures {}).write_timeout(true), LEGACY_DEVICE_TIMEOUT);
    }
}
