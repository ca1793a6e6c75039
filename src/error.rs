//! Proximity unlock error types.
//!
//! # Error Classification
//!
//! Errors are grouped by the layer that raises them:
//!
//! | Error                 | Raised by                  | Policy in receive loop        |
//! |-----------------------|----------------------------|-------------------------------|
//! | `TransportError`      | connector, framer          | ends the connection           |
//! | `DecodeError`         | framer, message model      | logged, frame dropped         |
//! | `ProtocolError`       | dispatcher, peer           | logged, frame dropped         |
//! | `RegistrationError`   | dispatcher (keys reply)    | terminal for the attempt      |
//! | `AuthenticationError` | dispatcher (nonce/mac)     | terminal for the attempt      |
//!
//! [`ProximityError`] aggregates all of them and preserves the inner error as
//! `#[source]`, so `anyhow` in the binary prints the full chain.

use std::time::Duration;

use thiserror::Error;

use crate::auth::{AuthStatus, FinishStatus, RegistrationStatus};
use crate::crypto::CryptoError;
use crate::protocol::Command;
use crate::transport::ProtectionLevel;

/// Connect, read and write failures of the byte-stream transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The remote endpoint could not be reached.
    #[error("Remote device unreachable: {0}")]
    Unreachable(String),

    /// The link cannot provide the protection level required by configuration.
    #[error("Protection level mismatch: required {required}, available {available}")]
    ProtectionMismatch {
        /// Minimum level required by the host.
        required: ProtectionLevel,
        /// Best level both sides support.
        available: ProtectionLevel,
    },

    /// The remote device does not advertise the proximity service.
    #[error("Service not advertised: {0}")]
    ServiceNotFound(String),

    /// The advertised service record failed validation.
    #[error("Invalid service record: {0}")]
    InvalidServiceRecord(String),

    /// The remote side closed the stream.
    #[error("Disconnect triggered by remote device")]
    Disconnected,

    /// The operation was aborted locally (connection torn down).
    #[error("I/O operation aborted")]
    Aborted,

    /// Connecting did not finish within the configured bound.
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Underlying I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A frame or payload that could not be decoded.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Frame is not valid base64.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Decoded frame is not valid UTF-8.
    #[error("UTF-8 decode error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Payload is not the expected JSON shape.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// JSON object carries no command discriminator.
    #[error("Missing {0} field")]
    MissingDiscriminator(&'static str),

    /// Frame grew past the configured limit before a terminator arrived.
    #[error("Frame too large: {len} bytes (maximum {max})")]
    FrameTooLarge {
        /// Bytes accumulated so far.
        len: usize,
        /// Configured maximum.
        max: usize,
    },
}

/// A well-formed message that does not fit the protocol state.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Discriminator names no known command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Known command, wrong direction (a request received by the host, or a
    /// reply received by the companion).
    #[error("Unexpected command: {0}")]
    UnexpectedCommand(Command),

    /// A reply arrived with no matching request in flight.
    #[error("Unsolicited reply: {0}")]
    UnsolicitedReply(Command),

    /// MAC reply received while no authentication attempt is in progress.
    #[error("No authentication in progress")]
    NoAuthenticationInProgress,

    /// The host's service HMAC did not verify on the companion side.
    #[error("Service HMAC mismatch")]
    ServiceHmacMismatch,
}

/// Device registration failures.
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Companion-device sign-in is disabled by policy.
    #[error("Disabled by policy. Please update the policy and try again.")]
    DisabledByPolicy,

    /// The user has no PIN configured.
    #[error("Please setup PIN for your device and try again.")]
    PinSetupRequired,

    /// Any other non-started status.
    #[error("Registration rejected: {0}")]
    Rejected(RegistrationStatus),

    /// `finish_register` or `unregister` named an unknown device.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
}

impl From<RegistrationStatus> for RegistrationError {
    fn from(status: RegistrationStatus) -> Self {
        match status {
            RegistrationStatus::DisabledByPolicy => Self::DisabledByPolicy,
            RegistrationStatus::PinSetupRequired => Self::PinSetupRequired,
            other => Self::Rejected(other),
        }
    }
}

/// Authentication attempt failures.
#[derive(Error, Debug)]
pub enum AuthenticationError {
    /// No device was selected for this session.
    #[error("No device selected for authentication")]
    NoDeviceSelected,

    /// The subsystem refused to start an attempt.
    #[error("Could not start authentication: {0}")]
    NotStarted(AuthStatus),

    /// The subsystem did not accept the device's authenticators.
    #[error("Unable to complete authentication: {0}")]
    NotCompleted(FinishStatus),

    /// The MAC reply arrived after the attempt lifetime.
    #[error("Authentication attempt expired after {elapsed:?} (limit {ttl:?})")]
    Expired {
        /// Time since the attempt started.
        elapsed: Duration,
        /// Configured attempt lifetime.
        ttl: Duration,
    },
}

/// Proximity unlock errors.
#[derive(Error, Debug)]
pub enum ProximityError {
    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Undecodable frame or payload.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Protocol state violation.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Registration failure.
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Authentication failure.
    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// No reply completed the session within the configured bound.
    #[error("Session timed out after {0:?}")]
    SessionTimeout(Duration),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias for proximity operations
pub type Result<T> = std::result::Result<T, ProximityError>;

/// Coarse failure category reported with a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// See [`TransportError`].
    Transport,
    /// See [`DecodeError`].
    Decode,
    /// See [`ProtocolError`].
    Protocol,
    /// See [`RegistrationError`].
    Registration,
    /// See [`AuthenticationError`].
    Authentication,
    /// The session stalled past its time limit.
    Timeout,
    /// Crypto or configuration problem on the host.
    Internal,
}

impl ProximityError {
    /// Whether the receive loop may drop the offending frame and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Protocol(_))
    }

    /// Failure category for session reporting.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) => FailureKind::Transport,
            Self::Decode(_) => FailureKind::Decode,
            Self::Protocol(_) => FailureKind::Protocol,
            Self::Registration(_) => FailureKind::Registration,
            Self::Authentication(_) => FailureKind::Authentication,
            Self::SessionTimeout(_) => FailureKind::Timeout,
            Self::Crypto(_) | Self::Config(_) => FailureKind::Internal,
        }
    }
}

impl From<CryptoError> for ProximityError {
    fn from(err: CryptoError) -> Self {
        ProximityError::Crypto(err)
    }
}

impl From<base64::DecodeError> for ProximityError {
    fn from(err: base64::DecodeError) -> Self {
        ProximityError::Decode(DecodeError::Base64(err))
    }
}

impl From<serde_json::Error> for ProximityError {
    fn from(err: serde_json::Error) -> Self {
        ProximityError::Decode(DecodeError::Json(err))
    }
}

impl From<std::io::Error> for ProximityError {
    fn from(err: std::io::Error) -> Self {
        ProximityError::Transport(TransportError::Io(err))
    }
}

impl From<toml::de::Error> for ProximityError {
    fn from(err: toml::de::Error) -> Self {
        ProximityError::Config(err.to_string())
    }
}
