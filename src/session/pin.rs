//! PIN unlock over the scrambled matrix.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{encode_positions, SessionKind, SessionManager};
use crate::device_registry::IdentityHold;
use crate::error::{DeviceError, SessionError};
use crate::events::DeviceEvent;
use crate::identity::DeviceIdentity;
use crate::messages::{Message, Ping, PinMatrixAck, PinMatrixRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    AwaitingPositions,
    Verifying,
    Unlocked,
    /// The last PIN was rejected; the next submission starts a fresh attempt.
    Failed,
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PinState::AwaitingPositions => "awaiting positions",
            PinState::Verifying => "verifying",
            PinState::Unlocked => "unlocked",
            PinState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub(crate) struct PinSession {
    device_id: DeviceIdentity,
    state: PinState,
    attempts: u32,
    _hold: IdentityHold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinSessionInfo {
    pub session_id: Uuid,
    pub device_id: String,
    pub state: PinState,
    pub attempts: u32,
    /// Credential the device asked for instead of a PIN.
    pub next_step: Option<SessionKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinUnlockResult {
    pub success: bool,
    pub next_step: Option<SessionKind>,
    pub session_id: Uuid,
    pub error: Option<String>,
}

// A PIN-protected Ping makes a locked device show the matrix.
fn pin_ping() -> Message {
    Ping {
        message: Some("unlock".into()),
        pin_protection: Some(true),
        ..Default::default()
    }
    .into()
}

impl SessionManager {
    /// Ask the device for its PIN matrix.
    ///
    /// An already-unlocked device ends the session straight away; one that
    /// answers with a passphrase request is unlocked too, with the passphrase
    /// as the next step.
    #[instrument(level = "info", skip(self))]
    pub async fn start_pin_unlock(&self, device_id: &str) -> Result<PinSessionInfo, SessionError> {
        let device = self.registry.resolve_id(device_id);
        let session_id = Uuid::new_v4();
        self.claim(&device, SessionKind::Pin, session_id)?;
        let hold = self.registry.hold(device.as_str());

        let opening = if self.take_prompt(&device, SessionKind::Pin) {
            Ok(PinMatrixRequest::default().into())
        } else {
            self.exchange(&device, pin_ping()).await
        };

        let info = |state, next_step| PinSessionInfo {
            session_id,
            device_id: device.to_string(),
            state,
            attempts: 0,
            next_step,
        };

        match opening {
            Ok(Message::PinMatrixRequest(_)) => {
                self.pins.insert(
                    session_id,
                    PinSession {
                        device_id: device.clone(),
                        state: PinState::AwaitingPositions,
                        attempts: 0,
                        _hold: hold,
                    },
                );
                self.started(&device, session_id, SessionKind::Pin);
                self.events().emit(DeviceEvent::PinRequested {
                    device_id: device.to_string(),
                    session_id,
                });
                Ok(info(PinState::AwaitingPositions, None))
            }
            Ok(Message::Success(_)) => {
                info!("{} is already unlocked", device);
                self.release_claim(&device, session_id);
                Ok(info(PinState::Unlocked, None))
            }
            Ok(Message::PassphraseRequest(_)) => {
                self.release_claim(&device, session_id);
                self.set_prompt(&device, SessionKind::Passphrase);
                Ok(info(PinState::Unlocked, Some(SessionKind::Passphrase)))
            }
            Ok(Message::Failure(failure)) => {
                self.release_claim(&device, session_id);
                Err(SessionError::DeviceFailure {
                    device_id: device.to_string(),
                    code: failure.code,
                    message: failure.message().to_string(),
                })
            }
            Ok(other) => {
                self.release_claim(&device, session_id);
                Err(DeviceError::UnexpectedResponse {
                    device_id: device.to_string(),
                    action: "Ping".into(),
                    received: other.name().to_string(),
                }
                .into())
            }
            Err(e) => {
                self.release_claim(&device, session_id);
                Err(e)
            }
        }
    }

    /// Submit the matrix positions the user picked (1-9, as laid out on the device screen).
    #[instrument(level = "info", skip(self, positions), fields(len = positions.len()))]
    pub async fn send_pin_unlock_response(
        &self,
        session_id: Uuid,
        positions: &[u8],
    ) -> Result<PinUnlockResult, SessionError> {
        let pin = encode_positions(positions)?;

        let (device, fresh_attempt) = {
            let mut session = self.pins.get_mut(&session_id).ok_or(SessionError::NotFound(session_id))?;
            let fresh_attempt = match session.state {
                PinState::AwaitingPositions => false,
                PinState::Failed => true,
                other => {
                    return Err(SessionError::InvalidState {
                        session_id,
                        action: "submit a PIN",
                        state: other.to_string(),
                    })
                }
            };
            session.state = PinState::Verifying;
            session.attempts += 1;
            (session.device_id.clone(), fresh_attempt)
        };

        if fresh_attempt {
            // A rejected PIN ends the device's request; ask for the matrix again.
            match self.exchange(&device, pin_ping()).await {
                Ok(Message::PinMatrixRequest(_)) => {}
                Ok(Message::Success(_)) => return Ok(self.finish_pin(session_id, &device, None)),
                Ok(other) => {
                    self.set_pin_state(session_id, PinState::Failed);
                    return Err(DeviceError::UnexpectedResponse {
                        device_id: device.to_string(),
                        action: "Ping".into(),
                        received: other.name().to_string(),
                    }
                    .into());
                }
                Err(e) => {
                    self.set_pin_state(session_id, PinState::Failed);
                    return Err(e);
                }
            }
        }

        let response = self.exchange(&device, PinMatrixAck { pin }.into()).await;
        if !self.pins.contains_key(&session_id) {
            return Err(SessionError::Cancelled(session_id));
        }

        match response {
            Ok(Message::Success(_)) => Ok(self.finish_pin(session_id, &device, None)),
            Ok(Message::PassphraseRequest(_)) => {
                info!("PIN accepted on {}; device now wants its passphrase", device);
                self.set_prompt(&device, SessionKind::Passphrase);
                Ok(self.finish_pin(session_id, &device, Some(SessionKind::Passphrase)))
            }
            Ok(Message::Failure(failure)) => {
                warn!("PIN rejected on {}: {}", device, failure.message());
                self.set_pin_state(session_id, PinState::Failed);
                Ok(PinUnlockResult {
                    success: false,
                    next_step: None,
                    session_id,
                    error: Some(failure.message().to_string()),
                })
            }
            Ok(Message::PinMatrixRequest(_)) => {
                self.set_pin_state(session_id, PinState::AwaitingPositions);
                self.events().emit(DeviceEvent::PinRequested {
                    device_id: device.to_string(),
                    session_id,
                });
                Ok(PinUnlockResult {
                    success: false,
                    next_step: None,
                    session_id,
                    error: Some("device requested the PIN again".into()),
                })
            }
            Ok(other) => {
                self.set_pin_state(session_id, PinState::Failed);
                Err(DeviceError::UnexpectedResponse {
                    device_id: device.to_string(),
                    action: "PinMatrixAck".into(),
                    received: other.name().to_string(),
                }
                .into())
            }
            Err(e) => {
                self.set_pin_state(session_id, PinState::Failed);
                Err(e)
            }
        }
    }

    pub fn pin_session(&self, session_id: Uuid) -> Option<PinSessionInfo> {
        self.pins.get(&session_id).map(|session| PinSessionInfo {
            session_id,
            device_id: session.device_id.to_string(),
            state: session.state,
            attempts: session.attempts,
            next_step: None,
        })
    }

    /// Returns false if the session was already gone.
    pub async fn cancel_pin_unlock(&self, session_id: Uuid) -> Result<bool, SessionError> {
        let Some((_, session)) = self.pins.remove(&session_id) else {
            return Ok(false);
        };
        self.ended(&session.device_id, session_id, SessionKind::Pin, "cancelled");
        self.send_cancel(&session.device_id).await;
        Ok(true)
    }

    /// Drop every PIN session for `device_id`, known or not, and cancel on the device.
    pub async fn force_cleanup_pin(&self, device_id: &str) -> Result<bool, SessionError> {
        let device = self.registry.resolve_id(device_id);
        let stale: Vec<Uuid> = self
            .pins
            .iter()
            .filter(|session| session.device_id == device)
            .map(|session| *session.key())
            .collect();
        for session_id in &stale {
            if self.pins.remove(session_id).is_some() {
                self.ended(&device, *session_id, SessionKind::Pin, "force_cleanup");
            }
        }
        self.send_cancel(&device).await;
        Ok(!stale.is_empty())
    }

    fn set_pin_state(&self, session_id: Uuid, state: PinState) {
        if let Some(mut session) = self.pins.get_mut(&session_id) {
            session.state = state;
        }
    }

    fn finish_pin(&self, session_id: Uuid, device: &DeviceIdentity, next_step: Option<SessionKind>) -> PinUnlockResult {
        self.pins.remove(&session_id);
        self.ended(device, session_id, SessionKind::Pin, "unlocked");
        PinUnlockResult {
            success: true,
            next_step,
            session_id,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{FailureType, PassphraseRequest, Success};
    use crate::session::test_support::manager;
    use crate::transport::mock::MockDevice;

    fn locked_device(accept: &'static str) -> MockDevice {
        MockDevice::new(move |msg| match msg {
            Message::Ping(_) => vec![PinMatrixRequest::default().into()],
            Message::PinMatrixAck(ack) if ack.pin == accept => vec![Success::default().into()],
            Message::PinMatrixAck(_) => vec![MockDevice::failure(FailureType::FailurePinInvalid, "Invalid PIN")],
            Message::Cancel(_) => vec![MockDevice::failure(FailureType::FailureActionCancelled, "Action cancelled")],
            _ => vec![],
        })
    }

    fn submitted_pins(device: &MockDevice) -> Vec<String> {
        device
            .received()
            .into_iter()
            .filter_map(|msg| match msg {
                Message::PinMatrixAck(ack) => Some(ack.pin),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn rejected_pin_leaves_no_residue_for_the_next_attempt() {
        let device = locked_device("282");
        let sessions = manager(&device);
        let started = sessions.start_pin_unlock("AAA").await.unwrap();
        assert_eq!(started.state, PinState::AwaitingPositions);

        let first = sessions.send_pin_unlock_response(started.session_id, &[5]).await.unwrap();
        assert!(!first.success);
        assert_eq!(first.error.as_deref(), Some("Invalid PIN"));
        assert_eq!(sessions.pin_session(started.session_id).unwrap().state, PinState::Failed);

        let second = sessions
            .send_pin_unlock_response(started.session_id, &[2, 8, 2])
            .await
            .unwrap();
        assert!(second.success);
        assert_eq!(second.next_step, None);
        assert_eq!(submitted_pins(&device), vec!["5", "282"]);
        assert!(sessions.pin_session(started.session_id).is_none());
        assert!(sessions.active_session("AAA").is_none());
    }

    #[tokio::test]
    async fn passphrase_request_after_pin_is_success() {
        let device = MockDevice::new(|msg| match msg {
            Message::Ping(_) => vec![PinMatrixRequest::default().into()],
            Message::PinMatrixAck(_) => vec![PassphraseRequest::default().into()],
            _ => vec![],
        });
        let sessions = manager(&device);
        let started = sessions.start_pin_unlock("AAA").await.unwrap();
        let result = sessions
            .send_pin_unlock_response(started.session_id, &[1, 2, 3, 4])
            .await
            .unwrap();

        assert_eq!(
            result,
            PinUnlockResult {
                success: true,
                next_step: Some(SessionKind::Passphrase),
                session_id: started.session_id,
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn unlocked_device_needs_no_session() {
        let device = MockDevice::keepkey();
        let sessions = manager(&device);
        let started = sessions.start_pin_unlock("AAA").await.unwrap();
        assert_eq!(started.state, PinState::Unlocked);
        assert!(sessions.active_session("AAA").is_none());
    }

    #[tokio::test]
    async fn invalid_positions_keep_the_session_waiting() {
        let device = locked_device("1");
        let sessions = manager(&device);
        let started = sessions.start_pin_unlock("AAA").await.unwrap();

        let err = sessions.send_pin_unlock_response(started.session_id, &[0]).await.unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(
            sessions.pin_session(started.session_id).unwrap().state,
            PinState::AwaitingPositions
        );
        assert!(submitted_pins(&device).is_empty());
    }

    #[tokio::test]
    async fn second_pin_session_is_rejected() {
        let device = locked_device("1");
        let sessions = manager(&device);
        sessions.start_pin_unlock("AAA").await.unwrap();
        let err = sessions.start_pin_unlock("AAA").await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive { kind: SessionKind::Pin, .. }));
    }

    #[tokio::test]
    async fn cancel_releases_the_device() {
        let device = locked_device("1");
        let sessions = manager(&device);
        let started = sessions.start_pin_unlock("AAA").await.unwrap();

        assert!(sessions.cancel_pin_unlock(started.session_id).await.unwrap());
        assert!(!sessions.cancel_pin_unlock(started.session_id).await.unwrap());
        assert_eq!(device.received_names().last(), Some(&"Cancel"));
        assert!(sessions.active_session("AAA").is_none());
        assert!(matches!(
            sessions.send_pin_unlock_response(started.session_id, &[1]).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn force_cleanup_without_a_session_still_cancels() {
        let device = locked_device("1");
        let sessions = manager(&device);
        assert!(!sessions.force_cleanup_pin("AAA").await.unwrap());
        assert_eq!(device.received_names(), vec!["Cancel"]);
    }
}
