//! Per-connection protocol state.
//!
//! A [`Session`] holds no I/O; the dispatcher asks it whether a reply is
//! expected before acting and records each transition afterwards.

use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use super::message::Command;
use crate::auth::{AuthAttempt, DeviceInfo};
use crate::error::{FailureKind, ProtocolError, ProximityError, Result};

/// Registration track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No registration in flight
    Idle,
    /// `REQUEST_KEYS` sent
    AwaitingKeysReply,
}

/// Authentication track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// No attempt in flight
    Idle,
    /// `REQUEST_NONCE` sent
    AwaitingNonceReply,
    /// The subsystem accepted an attempt
    AuthenticationStarted,
    /// `REQUEST_MAC` sent
    AwaitingMacReply,
    /// The subsystem accepted the device's authenticators
    Completed,
    /// Attempt ended with a terminal error
    Failed,
}

/// The device a session authenticates, chosen before the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSelection {
    /// Registered device id
    pub device_id: String,
    /// Friendly name for notifications
    pub device_name: String,
}

impl From<&DeviceInfo> for SessionSelection {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            device_id: info.device_id.clone(),
            device_name: info.friendly_name.clone(),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SessionOutcome {
    /// A new companion device was registered
    Registered {
        /// Assigned device id
        device_id: String,
        /// Name reported by the device
        device_name: String,
    },
    /// The host accepted the device's authenticators
    Authenticated {
        /// Authenticated device id
        device_id: String,
    },
    /// The session failed
    Failed {
        /// Failure category
        kind: FailureKind,
        /// Human-readable reason
        reason: String,
    },
    /// The connection was closed before anything completed
    Cancelled,
}

impl SessionOutcome {
    /// Failed outcome describing `err`
    pub fn from_error(err: &ProximityError) -> Self {
        Self::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }

    /// Whether the session achieved its goal
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Registered { .. } | Self::Authenticated { .. })
    }

    /// Failure reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// An attempt the subsystem started, with its start time.
#[derive(Debug, Clone)]
pub struct InFlightAttempt {
    /// Attempt handle and challenge values
    pub attempt: AuthAttempt,
    /// When the subsystem started it
    pub started: Instant,
}

impl InFlightAttempt {
    /// Time since the attempt started
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Protocol state for one connection
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    registration: RegistrationState,
    auth: AuthState,
    attempt: Option<InFlightAttempt>,
    completed: bool,
    created: Instant,
    messages_sent: u64,
    messages_received: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Create an idle session
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            registration: RegistrationState::Idle,
            auth: AuthState::Idle,
            attempt: None,
            completed: false,
            created: Instant::now(),
            messages_sent: 0,
            messages_received: 0,
        }
    }

    /// Session id (for logs)
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Registration track state
    pub fn registration_state(&self) -> RegistrationState {
        self.registration
    }

    /// Authentication track state
    pub fn auth_state(&self) -> AuthState {
        self.auth
    }

    /// Attempt in flight, if any
    pub fn attempt(&self) -> Option<&InFlightAttempt> {
        self.attempt.as_ref()
    }

    /// Whether the session reached its goal
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Time since the session was created
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// `(sent, received)` message counters
    pub fn message_counts(&self) -> (u64, u64) {
        (self.messages_sent, self.messages_received)
    }

    fn is_idle(&self) -> bool {
        self.registration == RegistrationState::Idle
            && matches!(self.auth, AuthState::Idle)
            && !self.completed
    }

    /// Record a `REQUEST_KEYS` about to be sent.
    pub fn keys_requested(&mut self) -> Result<()> {
        if !self.is_idle() {
            return Err(ProtocolError::UnexpectedCommand(Command::RequestKeys).into());
        }
        self.registration = RegistrationState::AwaitingKeysReply;
        self.messages_sent += 1;
        Ok(())
    }

    /// Record a `REQUEST_NONCE` about to be sent.
    pub fn nonce_requested(&mut self) -> Result<()> {
        if !self.is_idle() {
            return Err(ProtocolError::UnexpectedCommand(Command::RequestNonce).into());
        }
        self.auth = AuthState::AwaitingNonceReply;
        self.messages_sent += 1;
        Ok(())
    }

    /// Check that `command` answers a request in flight.
    ///
    /// On error the state is left untouched.
    pub fn accept_reply(&mut self, command: Command) -> Result<()> {
        let expected = match command {
            Command::RequestKeysReply => self.registration == RegistrationState::AwaitingKeysReply,
            Command::RequestNonceReply => self.auth == AuthState::AwaitingNonceReply,
            Command::RequestMacReply => {
                if self.auth != AuthState::AwaitingMacReply || self.attempt.is_none() {
                    return Err(ProtocolError::NoAuthenticationInProgress.into());
                }
                true
            }
            other => return Err(ProtocolError::UnexpectedCommand(other).into()),
        };
        if !expected {
            return Err(ProtocolError::UnsolicitedReply(command).into());
        }
        self.messages_received += 1;
        Ok(())
    }

    /// Keys reply consumed; registration track back to idle.
    pub fn keys_consumed(&mut self) {
        self.registration = RegistrationState::Idle;
    }

    /// Registration finished.
    pub fn registered(&mut self) {
        self.registration = RegistrationState::Idle;
        self.completed = true;
    }

    /// The subsystem started `attempt`.
    pub fn attempt_started(&mut self, attempt: AuthAttempt) {
        self.attempt = Some(InFlightAttempt {
            attempt,
            started: Instant::now(),
        });
        self.auth = AuthState::AuthenticationStarted;
    }

    /// `REQUEST_MAC` sent.
    pub fn mac_requested(&mut self) {
        self.auth = AuthState::AwaitingMacReply;
        self.messages_sent += 1;
    }

    /// Authentication accepted.
    pub fn authenticated(&mut self) {
        self.auth = AuthState::Completed;
        self.attempt = None;
        self.completed = true;
    }

    /// Terminal failure: drop any attempt.
    pub fn fail(&mut self) {
        if self.auth != AuthState::Idle {
            self.auth = AuthState::Failed;
        }
        self.registration = RegistrationState::Idle;
        self.attempt = None;
    }
}
