use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{SessionKind, SessionManager};
use crate::device_registry::IdentityHold;
use crate::error::{DeviceError, SessionError};
use crate::events::DeviceEvent;
use crate::identity::DeviceIdentity;
use crate::messages::{Message, PassphraseAck, PassphraseRequest, Ping};

/// Longest passphrase the firmware accepts.
pub const MAX_PASSPHRASE_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassphraseState {
    Idle,
    AwaitingPassphrase,
    Verifying,
    Accepted,
    Failed,
}

impl fmt::Display for PassphraseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PassphraseState::Idle => "idle",
            PassphraseState::AwaitingPassphrase => "awaiting passphrase",
            PassphraseState::Verifying => "verifying",
            PassphraseState::Accepted => "accepted",
            PassphraseState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub(crate) struct PassphraseSession {
    device_id: DeviceIdentity,
    state: PassphraseState,
    _hold: IdentityHold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassphraseSessionInfo {
    pub session_id: Uuid,
    pub device_id: String,
    pub state: PassphraseState,
    pub next_step: Option<SessionKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassphraseResult {
    pub success: bool,
    pub next_step: Option<SessionKind>,
    pub session_id: Uuid,
    pub error: Option<String>,
}

fn passphrase_ping() -> Message {
    Ping {
        message: Some("passphrase".into()),
        passphrase_protection: Some(true),
        ..Default::default()
    }
    .into()
}

impl SessionManager {
    /// Open a passphrase session. If the device wants its PIN first, no
    /// session is opened and `next_step` says so.
    #[instrument(level = "info", skip(self))]
    pub async fn start_passphrase(&self, device_id: &str) -> Result<PassphraseSessionInfo, SessionError> {
        let device = self.registry.resolve_id(device_id);
        let session_id = Uuid::new_v4();
        self.claim(&device, SessionKind::Passphrase, session_id)?;
        let hold = self.registry.hold(device.as_str());

        let opening = if self.take_prompt(&device, SessionKind::Passphrase) {
            Ok(PassphraseRequest::default().into())
        } else {
            self.exchange(&device, passphrase_ping()).await
        };

        let info = |state, next_step| PassphraseSessionInfo {
            session_id,
            device_id: device.to_string(),
            state,
            next_step,
        };

        let outcome = match opening {
            Ok(Message::PassphraseRequest(_)) => {
                self.passphrases.insert(
                    session_id,
                    PassphraseSession {
                        device_id: device.clone(),
                        state: PassphraseState::AwaitingPassphrase,
                        _hold: hold,
                    },
                );
                self.started(&device, session_id, SessionKind::Passphrase);
                self.events().emit(DeviceEvent::PassphraseRequested {
                    device_id: device.to_string(),
                    session_id,
                });
                return Ok(info(PassphraseState::AwaitingPassphrase, None));
            }
            Ok(Message::Success(_)) => Ok(info(PassphraseState::Accepted, None)),
            Ok(Message::PinMatrixRequest(_)) => {
                self.set_prompt(&device, SessionKind::Pin);
                Ok(info(PassphraseState::Idle, Some(SessionKind::Pin)))
            }
            Ok(Message::Failure(failure)) => Err(SessionError::DeviceFailure {
                device_id: device.to_string(),
                code: failure.code,
                message: failure.message().to_string(),
            }),
            Ok(other) => Err(DeviceError::UnexpectedResponse {
                device_id: device.to_string(),
                action: "Ping".into(),
                received: other.name().to_string(),
            }
            .into()),
            Err(e) => Err(e),
        };
        self.release_claim(&device, session_id);
        outcome
    }

    #[instrument(level = "info", skip(self, passphrase))]
    pub async fn send_passphrase(&self, session_id: Uuid, passphrase: &str) -> Result<PassphraseResult, SessionError> {
        if passphrase.chars().count() > MAX_PASSPHRASE_LEN {
            return Err(SessionError::InvalidInput(format!(
                "passphrase longer than {MAX_PASSPHRASE_LEN} characters"
            )));
        }

        let (device, fresh_attempt) = {
            let mut session = self
                .passphrases
                .get_mut(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;
            let fresh_attempt = match session.state {
                PassphraseState::AwaitingPassphrase => false,
                PassphraseState::Failed => true,
                other => {
                    return Err(SessionError::InvalidState {
                        session_id,
                        action: "submit a passphrase",
                        state: other.to_string(),
                    })
                }
            };
            session.state = PassphraseState::Verifying;
            (session.device_id.clone(), fresh_attempt)
        };

        if fresh_attempt {
            match self.exchange(&device, passphrase_ping()).await {
                Ok(Message::PassphraseRequest(_)) => {}
                Ok(Message::Success(_)) => return Ok(self.finish_passphrase(session_id, &device, None)),
                Ok(other) => {
                    self.set_passphrase_state(session_id, PassphraseState::Failed);
                    return Err(DeviceError::UnexpectedResponse {
                        device_id: device.to_string(),
                        action: "Ping".into(),
                        received: other.name().to_string(),
                    }
                    .into());
                }
                Err(e) => {
                    self.set_passphrase_state(session_id, PassphraseState::Failed);
                    return Err(e);
                }
            }
        }

        let ack = PassphraseAck {
            passphrase: passphrase.to_string(),
        };
        let response = self.exchange(&device, ack.into()).await;
        if !self.passphrases.contains_key(&session_id) {
            return Err(SessionError::Cancelled(session_id));
        }

        match response {
            Ok(Message::Success(_)) => Ok(self.finish_passphrase(session_id, &device, None)),
            Ok(Message::PinMatrixRequest(_)) => {
                info!("Passphrase accepted on {}; device now wants its PIN", device);
                self.set_prompt(&device, SessionKind::Pin);
                Ok(self.finish_passphrase(session_id, &device, Some(SessionKind::Pin)))
            }
            Ok(Message::Failure(failure)) => {
                warn!("Passphrase rejected on {}: {}", device, failure.message());
                self.set_passphrase_state(session_id, PassphraseState::Failed);
                Ok(PassphraseResult {
                    success: false,
                    next_step: None,
                    session_id,
                    error: Some(failure.message().to_string()),
                })
            }
            Ok(other) => {
                self.set_passphrase_state(session_id, PassphraseState::Failed);
                Err(DeviceError::UnexpectedResponse {
                    device_id: device.to_string(),
                    action: "PassphraseAck".into(),
                    received: other.name().to_string(),
                }
                .into())
            }
            Err(e) => {
                self.set_passphrase_state(session_id, PassphraseState::Failed);
                Err(e)
            }
        }
    }

    pub fn passphrase_session(&self, session_id: Uuid) -> Option<PassphraseSessionInfo> {
        self.passphrases.get(&session_id).map(|session| PassphraseSessionInfo {
            session_id,
            device_id: session.device_id.to_string(),
            state: session.state,
            next_step: None,
        })
    }

    pub async fn cancel_passphrase(&self, session_id: Uuid) -> Result<bool, SessionError> {
        let Some((_, session)) = self.passphrases.remove(&session_id) else {
            return Ok(false);
        };
        self.ended(&session.device_id, session_id, SessionKind::Passphrase, "cancelled");
        self.send_cancel(&session.device_id).await;
        Ok(true)
    }

    pub async fn force_cleanup_passphrase(&self, device_id: &str) -> Result<bool, SessionError> {
        let device = self.registry.resolve_id(device_id);
        let stale: Vec<Uuid> = self
            .passphrases
            .iter()
            .filter(|session| session.device_id == device)
            .map(|session| *session.key())
            .collect();
        for session_id in &stale {
            if self.passphrases.remove(session_id).is_some() {
                self.ended(&device, *session_id, SessionKind::Passphrase, "force_cleanup");
            }
        }
        self.send_cancel(&device).await;
        Ok(!stale.is_empty())
    }

    fn set_passphrase_state(&self, session_id: Uuid, state: PassphraseState) {
        if let Some(mut session) = self.passphrases.get_mut(&session_id) {
            session.state = state;
        }
    }

    fn finish_passphrase(
        &self,
        session_id: Uuid,
        device: &DeviceIdentity,
        next_step: Option<SessionKind>,
    ) -> PassphraseResult {
        self.passphrases.remove(&session_id);
        self.ended(device, session_id, SessionKind::Passphrase, "accepted");
        PassphraseResult {
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
    use crate::messages::{PinMatrixRequest, Success};
    use crate::session::pin::PinState;
    use crate::session::test_support::manager;
    use crate::transport::mock::MockDevice;

    #[tokio::test]
    async fn pin_then_passphrase_hands_off_without_reprompting() {
        let device = MockDevice::new(|msg| match msg {
            Message::Ping(_) => vec![PinMatrixRequest::default().into()],
            Message::PinMatrixAck(_) => vec![PassphraseRequest::default().into()],
            Message::PassphraseAck(_) => vec![Success::default().into()],
            _ => vec![],
        });
        let sessions = manager(&device);
        let pin = sessions.start_pin_unlock("AAA").await.unwrap();
        let unlocked = sessions.send_pin_unlock_response(pin.session_id, &[3, 3]).await.unwrap();
        assert_eq!(unlocked.next_step, Some(SessionKind::Passphrase));

        let started = sessions.start_passphrase("AAA").await.unwrap();
        assert_eq!(started.state, PassphraseState::AwaitingPassphrase);
        let result = sessions.send_passphrase(started.session_id, "hunter2").await.unwrap();
        assert!(result.success);
        assert_eq!(result.next_step, None);
        assert_eq!(device.received_names(), vec!["Ping", "PinMatrixAck", "PassphraseAck"]);
    }

    #[tokio::test]
    async fn passphrase_then_pin_is_also_valid() {
        let device = MockDevice::new(|msg| match msg {
            Message::Ping(_) => vec![PassphraseRequest::default().into()],
            Message::PassphraseAck(_) => vec![PinMatrixRequest::default().into()],
            Message::PinMatrixAck(_) => vec![Success::default().into()],
            _ => vec![],
        });
        let sessions = manager(&device);
        let started = sessions.start_passphrase("AAA").await.unwrap();
        let result = sessions.send_passphrase(started.session_id, "").await.unwrap();
        assert_eq!(result.next_step, Some(SessionKind::Pin));

        let pin = sessions.start_pin_unlock("AAA").await.unwrap();
        assert_eq!(pin.state, PinState::AwaitingPositions);
        assert!(sessions.send_pin_unlock_response(pin.session_id, &[1]).await.unwrap().success);
        assert_eq!(device.received_names(), vec!["Ping", "PassphraseAck", "PinMatrixAck"]);
    }

    #[tokio::test]
    async fn pin_first_opens_no_passphrase_session() {
        let device = MockDevice::new(|msg| match msg {
            Message::Ping(_) => vec![PinMatrixRequest::default().into()],
            _ => vec![],
        });
        let sessions = manager(&device);
        let started = sessions.start_passphrase("AAA").await.unwrap();
        assert_eq!(started.next_step, Some(SessionKind::Pin));
        assert!(sessions.passphrase_session(started.session_id).is_none());
        assert!(sessions.active_session("AAA").is_none());
    }

    #[tokio::test]
    async fn overlong_passphrase_is_rejected_locally() {
        let device = MockDevice::new(|msg| match msg {
            Message::Ping(_) => vec![PassphraseRequest::default().into()],
            _ => vec![],
        });
        let sessions = manager(&device);
        let started = sessions.start_passphrase("AAA").await.unwrap();
        let long = "x".repeat(MAX_PASSPHRASE_LEN + 1);
        let err = sessions.send_passphrase(started.session_id, &long).await.unwrap_err();
        assert_eq!(err.code(), "KK-S05");
        assert_eq!(device.received_names(), vec!["Ping"]);
    }

    #[tokio::test]
    async fn pin_session_blocks_passphrase_session() {
        let device = MockDevice::new(|msg| match msg {
            Message::Ping(_) => vec![PinMatrixRequest::default().into()],
            _ => vec![],
        });
        let sessions = manager(&device);
        sessions.start_pin_unlock("AAA").await.unwrap();
        assert!(matches!(
            sessions.start_passphrase("AAA").await,
            Err(SessionError::AlreadyActive { kind: SessionKind::Pin, .. })
        ));
    }
}
