//! Seed verification: a dry-run recovery driven one character at a time
//! through the device's scrambled cipher.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{encode_positions, SessionKind, SessionManager};
use crate::device_registry::IdentityHold;
use crate::error::{DeviceError, SessionError};
use crate::events::DeviceEvent;
use crate::identity::DeviceIdentity;
use crate::messages::{CharacterAck, CharacterRequest, Failure, Message, PinMatrixAck, RecoveryDevice};

pub const WORD_COUNTS: [u32; 3] = [12, 18, 24];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// End the current word.
    Space,
    /// Backspace.
    Delete,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    AwaitingPin,
    AwaitingCharacter,
    Submitting,
    Verified,
    Mismatch,
    Failed,
}

impl RecoveryState {
    pub fn is_complete(self) -> bool {
        matches!(self, RecoveryState::Verified | RecoveryState::Mismatch | RecoveryState::Failed)
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecoveryState::AwaitingPin => "awaiting PIN",
            RecoveryState::AwaitingCharacter => "awaiting character",
            RecoveryState::Submitting => "submitting",
            RecoveryState::Verified => "verified",
            RecoveryState::Mismatch => "mismatch",
            RecoveryState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub(crate) struct RecoverySession {
    device_id: DeviceIdentity,
    word_count: u32,
    word_pos: u32,
    character_pos: u32,
    state: RecoveryState,
    _hold: IdentityHold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySessionInfo {
    pub session_id: Uuid,
    pub device_id: String,
    pub word_count: u32,
    pub state: RecoveryState,
    pub word_pos: u32,
    pub character_pos: u32,
}

/// Where the device's cursor stands after one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryProgress {
    pub session_id: Uuid,
    pub state: RecoveryState,
    pub word_pos: u32,
    pub character_pos: u32,
    /// The device finished the word on its own.
    pub auto_completed: bool,
    pub is_complete: bool,
    /// Device-supplied detail for a mismatch or failure.
    pub error: Option<String>,
}

fn dry_run(word_count: u32) -> Message {
    RecoveryDevice {
        word_count: Some(word_count),
        passphrase_protection: None,
        pin_protection: None,
        language: Some("english".into()),
        label: None,
        enforce_wordlist: Some(true),
        use_character_cipher: Some(true),
        auto_lock_delay_ms: None,
        u2f_counter: None,
        dry_run: Some(true),
    }
    .into()
}

/// The device refuses a new recovery while a previous one is still open.
fn is_stale_recovery(failure: &Failure) -> bool {
    let message = failure.message().to_lowercase();
    message.contains("recovery") && (message.contains("already") || message.contains("in progress") || message.contains("mode"))
}

fn is_mismatch(failure: &Failure) -> bool {
    let message = failure.message().to_lowercase();
    message.contains("match") || message.contains("invalid") || message.contains("word")
}

fn character_ack(character: Option<&str>, action: Option<RecoveryAction>) -> Result<CharacterAck, SessionError> {
    let ack = |character: Option<String>, delete, done| CharacterAck {
        character,
        delete: Some(delete),
        done: Some(done),
    };
    match (character, action) {
        (None, Some(RecoveryAction::Done)) => Ok(ack(None, false, true)),
        (None, Some(RecoveryAction::Delete)) => Ok(ack(None, true, false)),
        (None, Some(RecoveryAction::Space)) => Ok(ack(Some(" ".into()), false, false)),
        (Some(input), None) => {
            let mut chars = input.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => Ok(ack(Some(c.to_ascii_lowercase().to_string()), false, false)),
                _ => Err(SessionError::InvalidInput(format!(
                    "expected a single letter a-z, got {input:?}"
                ))),
            }
        }
        (Some(_), Some(_)) => Err(SessionError::InvalidInput("send a character or an action, not both".into())),
        (None, None) => Err(SessionError::InvalidInput("no character or action provided".into())),
    }
}

impl SessionManager {
    /// Start a dry-run recovery that checks the user's backup against the device seed.
    ///
    /// A leftover host session is force-cleaned first. A device still stuck
    /// in an earlier recovery is cancelled and asked once more. Either way the
    /// device gets `recovery_retry_pause` to settle before the next request.
    #[instrument(level = "info", skip(self))]
    pub async fn start_seed_verification(
        &self,
        device_id: &str,
        word_count: u32,
    ) -> Result<RecoverySessionInfo, SessionError> {
        if !WORD_COUNTS.contains(&word_count) {
            return Err(SessionError::InvalidInput(format!(
                "word count must be 12, 18 or 24, got {word_count}"
            )));
        }
        let device = self.registry.resolve_id(device_id);
        if let Some(features) = self.registry.features(device.as_str()) {
            if !features.initialized {
                return Err(SessionError::NotInitialized {
                    device_id: device.to_string(),
                });
            }
        }

        if let Some((SessionKind::Recovery, stale)) = self.active_session(device.as_str()) {
            warn!("{} still has recovery session {}; cleaning it up", device, stale);
            self.force_cleanup_seed_verification(device.as_str()).await?;
            tokio::time::sleep(self.config.recovery_retry_pause()).await;
        }

        let session_id = Uuid::new_v4();
        self.claim(&device, SessionKind::Recovery, session_id)?;
        let hold = self.registry.hold(device.as_str());

        let mut response = self.exchange(&device, dry_run(word_count)).await;
        if matches!(&response, Ok(Message::Failure(failure)) if is_stale_recovery(failure)) {
            warn!("{} reports an unfinished recovery; resetting and retrying once", device);
            self.reset_device_flow(&device).await;
            tokio::time::sleep(self.config.recovery_retry_pause()).await;
            response = self.exchange(&device, dry_run(word_count)).await;
        }

        let (state, word_pos, character_pos) = match response {
            Ok(Message::PinMatrixRequest(_)) => (RecoveryState::AwaitingPin, 0, 0),
            Ok(Message::CharacterRequest(CharacterRequest { word_pos, character_pos })) => {
                (RecoveryState::AwaitingCharacter, word_pos, character_pos)
            }
            Ok(Message::Failure(failure)) => {
                self.release_claim(&device, session_id);
                return Err(SessionError::DeviceFailure {
                    device_id: device.to_string(),
                    code: failure.code,
                    message: failure.message().to_string(),
                });
            }
            Ok(other) => {
                self.release_claim(&device, session_id);
                return Err(DeviceError::UnexpectedResponse {
                    device_id: device.to_string(),
                    action: "RecoveryDevice".into(),
                    received: other.name().to_string(),
                }
                .into());
            }
            Err(e) => {
                self.release_claim(&device, session_id);
                return Err(e);
            }
        };

        self.recoveries.insert(
            session_id,
            RecoverySession {
                device_id: device.clone(),
                word_count,
                word_pos,
                character_pos,
                state,
                _hold: hold,
            },
        );
        self.started(&device, session_id, SessionKind::Recovery);
        self.announce(&device, session_id, state, word_pos, character_pos);

        Ok(RecoverySessionInfo {
            session_id,
            device_id: device.to_string(),
            word_count,
            state,
            word_pos,
            character_pos,
        })
    }

    /// Answer the PIN prompt some devices show before a verification starts.
    #[instrument(level = "info", skip(self, positions))]
    pub async fn send_verification_pin(&self, session_id: Uuid, positions: &[u8]) -> Result<RecoveryProgress, SessionError> {
        let pin = encode_positions(positions)?;
        let device = self.begin_recovery_step(session_id, RecoveryState::AwaitingPin, "submit a PIN")?;
        let response = self.exchange(&device, PinMatrixAck { pin }.into()).await;
        self.apply_recovery_response(session_id, &device, "PinMatrixAck", false, response)
    }

    /// Send one letter or a control action. The cursor in the result is the
    /// device's, including any word it auto-completed.
    #[instrument(level = "debug", skip(self, character))]
    pub async fn send_verification_character(
        &self,
        session_id: Uuid,
        character: Option<&str>,
        action: Option<RecoveryAction>,
    ) -> Result<RecoveryProgress, SessionError> {
        let ack = character_ack(character, action)?;
        let is_letter = action.is_none();
        let device = self.begin_recovery_step(session_id, RecoveryState::AwaitingCharacter, "send a character")?;
        let response = self.exchange(&device, ack.into()).await;
        self.apply_recovery_response(session_id, &device, "CharacterAck", is_letter, response)
    }

    pub fn recovery_session(&self, session_id: Uuid) -> Option<RecoverySessionInfo> {
        self.recoveries.get(&session_id).map(|session| RecoverySessionInfo {
            session_id,
            device_id: session.device_id.to_string(),
            word_count: session.word_count,
            state: session.state,
            word_pos: session.word_pos,
            character_pos: session.character_pos,
        })
    }

    pub async fn cancel_seed_verification(&self, session_id: Uuid) -> Result<bool, SessionError> {
        let Some((_, session)) = self.recoveries.remove(&session_id) else {
            return Ok(false);
        };
        self.ended(&session.device_id, session_id, SessionKind::Recovery, "cancelled");
        self.send_cancel(&session.device_id).await;
        Ok(true)
    }

    /// Clear any recovery state for `device_id`, host side and device side,
    /// even when no session is known.
    pub async fn force_cleanup_seed_verification(&self, device_id: &str) -> Result<bool, SessionError> {
        let device = self.registry.resolve_id(device_id);
        let stale: Vec<Uuid> = self
            .recoveries
            .iter()
            .filter(|session| session.device_id == device)
            .map(|session| *session.key())
            .collect();
        for session_id in &stale {
            if self.recoveries.remove(session_id).is_some() {
                self.ended(&device, *session_id, SessionKind::Recovery, "force_cleanup");
            }
        }
        self.reset_device_flow(&device).await;
        info!("Recovery state cleared for {}", device);
        Ok(!stale.is_empty())
    }

    fn begin_recovery_step(
        &self,
        session_id: Uuid,
        expected: RecoveryState,
        action: &'static str,
    ) -> Result<DeviceIdentity, SessionError> {
        let mut session = self
            .recoveries
            .get_mut(&session_id)
            .ok_or(SessionError::NotFound(session_id))?;
        if session.state != expected {
            return Err(SessionError::InvalidState {
                session_id,
                action,
                state: session.state.to_string(),
            });
        }
        session.state = RecoveryState::Submitting;
        Ok(session.device_id.clone())
    }

    fn apply_recovery_response(
        &self,
        session_id: Uuid,
        device: &DeviceIdentity,
        action: &str,
        after_letter: bool,
        response: Result<Message, SessionError>,
    ) -> Result<RecoveryProgress, SessionError> {
        let Some(mut session) = self.recoveries.get_mut(&session_id) else {
            return Err(SessionError::Cancelled(session_id));
        };
        let previous_word = session.word_pos;
        let prior_state = if action == "PinMatrixAck" {
            RecoveryState::AwaitingPin
        } else {
            RecoveryState::AwaitingCharacter
        };

        let mut error = None;
        let mut auto_completed = false;
        match response {
            Ok(Message::CharacterRequest(request)) => {
                auto_completed = after_letter && request.word_pos > previous_word;
                session.word_pos = request.word_pos;
                session.character_pos = request.character_pos;
                session.state = RecoveryState::AwaitingCharacter;
            }
            Ok(Message::PinMatrixRequest(_)) => session.state = RecoveryState::AwaitingPin,
            Ok(Message::Success(_)) => session.state = RecoveryState::Verified,
            Ok(Message::Failure(failure)) => {
                session.state = if action == "CharacterAck" && is_mismatch(&failure) {
                    RecoveryState::Mismatch
                } else {
                    RecoveryState::Failed
                };
                error = Some(failure.message().to_string());
            }
            Ok(other) => {
                session.state = prior_state;
                return Err(DeviceError::UnexpectedResponse {
                    device_id: device.to_string(),
                    action: action.to_string(),
                    received: other.name().to_string(),
                }
                .into());
            }
            Err(e) => {
                session.state = prior_state;
                return Err(e);
            }
        }

        let progress = RecoveryProgress {
            session_id,
            state: session.state,
            word_pos: session.word_pos,
            character_pos: session.character_pos,
            auto_completed,
            is_complete: session.state.is_complete(),
            error,
        };
        drop(session);

        if progress.is_complete {
            self.recoveries.remove(&session_id);
            self.ended(device, session_id, SessionKind::Recovery, &progress.state.to_string());
        } else {
            self.announce(device, session_id, progress.state, progress.word_pos, progress.character_pos);
        }
        Ok(progress)
    }

    fn announce(&self, device: &DeviceIdentity, session_id: Uuid, state: RecoveryState, word_pos: u32, character_pos: u32) {
        let event = match state {
            RecoveryState::AwaitingPin => DeviceEvent::PinRequested {
                device_id: device.to_string(),
                session_id,
            },
            RecoveryState::AwaitingCharacter => DeviceEvent::CharacterRequested {
                device_id: device.to_string(),
                session_id,
                word_pos,
                character_pos,
            },
            _ => return,
        };
        self.events().emit(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::messages::{FailureType, PinMatrixRequest, Success};
    use crate::session::test_support::{manager, manager_with_pause};
    use crate::transport::mock::MockDevice;

    /// Accepts "cat" as the whole seed; the device auto-completes after "ca".
    fn verifying_device() -> MockDevice {
        let typed = Arc::new(AtomicUsize::new(0));
        MockDevice::new(move |msg| match msg {
            Message::RecoveryDevice(_) => vec![CharacterRequest { word_pos: 0, character_pos: 0 }.into()],
            Message::CharacterAck(ack) if ack.done == Some(true) => vec![Success::default().into()],
            Message::CharacterAck(ack) if ack.delete == Some(true) => {
                let n = typed.fetch_sub(1, Ordering::SeqCst) - 1;
                vec![CharacterRequest { word_pos: 0, character_pos: n as u32 }.into()]
            }
            Message::CharacterAck(_) => match typed.fetch_add(1, Ordering::SeqCst) + 1 {
                2 => vec![CharacterRequest { word_pos: 1, character_pos: 0 }.into()],
                n => vec![CharacterRequest { word_pos: 0, character_pos: n as u32 }.into()],
            },
            Message::Cancel(_) => vec![MockDevice::failure(FailureType::FailureActionCancelled, "Cancelled")],
            Message::Initialize(_) => vec![MockDevice::features().into()],
            _ => vec![],
        })
    }

    #[test]
    fn character_acks() {
        let letter = character_ack(Some("Q"), None).unwrap();
        assert_eq!(letter.character.as_deref(), Some("q"));
        assert_eq!(character_ack(None, Some(RecoveryAction::Space)).unwrap().character.as_deref(), Some(" "));
        assert_eq!(character_ack(None, Some(RecoveryAction::Done)).unwrap().done, Some(true));
        assert_eq!(character_ack(None, Some(RecoveryAction::Delete)).unwrap().delete, Some(true));
        assert!(character_ack(Some("ab"), None).is_err());
        assert!(character_ack(Some("1"), None).is_err());
        assert!(character_ack(None, None).is_err());
        assert!(character_ack(Some("a"), Some(RecoveryAction::Done)).is_err());
    }

    #[tokio::test]
    async fn cursor_follows_the_device() {
        let device = verifying_device();
        let sessions = manager(&device);
        let started = sessions.start_seed_verification("AAA", 12).await.unwrap();
        assert_eq!(started.state, RecoveryState::AwaitingCharacter);
        let id = started.session_id;

        let c = sessions.send_verification_character(id, Some("c"), None).await.unwrap();
        assert_eq!((c.word_pos, c.character_pos, c.auto_completed), (0, 1, false));

        let a = sessions.send_verification_character(id, Some("a"), None).await.unwrap();
        assert_eq!((a.word_pos, a.character_pos), (1, 0));
        assert!(a.auto_completed);

        let done = sessions
            .send_verification_character(id, None, Some(RecoveryAction::Done))
            .await
            .unwrap();
        assert_eq!(done.state, RecoveryState::Verified);
        assert!(done.is_complete);
        assert!(sessions.recovery_session(id).is_none());
        assert!(sessions.active_session("AAA").is_none());
    }

    #[tokio::test]
    async fn mismatch_carries_device_detail() {
        let device = MockDevice::new(|msg| match msg {
            Message::RecoveryDevice(_) => vec![CharacterRequest { word_pos: 0, character_pos: 0 }.into()],
            Message::CharacterAck(_) => vec![MockDevice::failure(
                FailureType::FailureOther,
                "The seed is valid but does not match the one in the device",
            )],
            _ => vec![],
        });
        let sessions = manager(&device);
        let started = sessions.start_seed_verification("AAA", 24).await.unwrap();
        let done = sessions
            .send_verification_character(started.session_id, None, Some(RecoveryAction::Done))
            .await
            .unwrap();
        assert_eq!(done.state, RecoveryState::Mismatch);
        assert!(done.error.unwrap().contains("does not match"));
    }

    #[tokio::test]
    async fn stale_recovery_is_cleaned_up_and_retried_once() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let device = MockDevice::new(move |msg| match msg {
            Message::RecoveryDevice(_) if counter.fetch_add(1, Ordering::SeqCst) == 0 => {
                vec![MockDevice::failure(FailureType::FailureOther, "Device is already in recovery mode")]
            }
            Message::RecoveryDevice(_) => vec![CharacterRequest { word_pos: 0, character_pos: 0 }.into()],
            Message::Cancel(_) => vec![MockDevice::failure(FailureType::FailureActionCancelled, "Cancelled")],
            Message::Initialize(_) => vec![MockDevice::features().into()],
            _ => vec![],
        });
        let sessions = manager(&device);

        let started = sessions.start_seed_verification("AAA", 12).await.unwrap();
        assert_eq!(started.state, RecoveryState::AwaitingCharacter);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(
            device.received_names(),
            vec!["RecoveryDevice", "Cancel", "Initialize", "RecoveryDevice"]
        );
        assert_eq!(device.opens(), 1);
    }

    #[tokio::test]
    async fn pin_prompt_before_verification() {
        let device = MockDevice::new(|msg| match msg {
            Message::RecoveryDevice(_) => vec![PinMatrixRequest::default().into()],
            Message::PinMatrixAck(_) => vec![CharacterRequest { word_pos: 0, character_pos: 0 }.into()],
            _ => vec![],
        });
        let sessions = manager(&device);
        let started = sessions.start_seed_verification("AAA", 18).await.unwrap();
        assert_eq!(started.state, RecoveryState::AwaitingPin);

        let early = sessions.send_verification_character(started.session_id, Some("a"), None).await;
        assert!(matches!(early, Err(SessionError::InvalidState { .. })));

        let progress = sessions.send_verification_pin(started.session_id, &[4, 2]).await.unwrap();
        assert_eq!(progress.state, RecoveryState::AwaitingCharacter);
    }

    #[tokio::test]
    async fn restarting_replaces_a_stale_host_session() {
        let device = verifying_device();
        let sessions = manager(&device);
        let first = sessions.start_seed_verification("AAA", 12).await.unwrap();
        let second = sessions.start_seed_verification("AAA", 12).await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert!(sessions.recovery_session(first.session_id).is_none());
        assert_eq!(
            sessions.active_session("AAA"),
            Some((SessionKind::Recovery, second.session_id))
        );
    }

    #[tokio::test]
    async fn restart_waits_for_the_device_to_settle() {
        let device = verifying_device();
        let sessions = manager_with_pause(&device, 300);
        sessions.start_seed_verification("AAA", 12).await.unwrap();

        let began = std::time::Instant::now();
        let second = sessions.start_seed_verification("AAA", 12).await.unwrap();
        assert!(began.elapsed() >= std::time::Duration::from_millis(300));
        assert_eq!(second.state, RecoveryState::AwaitingCharacter);
    }

    #[tokio::test]
    async fn rejects_bad_word_counts() {
        let device = verifying_device();
        let sessions = manager(&device);
        assert!(matches!(
            sessions.start_seed_verification("AAA", 13).await,
            Err(SessionError::InvalidInput(_))
        ));
        assert!(device.received().is_empty());
    }
}
