//! The host authentication subsystem, consumed as an opaque capability.
//!
//! The host OS owns key storage, policy enforcement and the final unlock
//! decision. This module describes that capability as the [`Authenticator`]
//! trait so the dispatcher and orchestrator run unchanged against the real
//! subsystem, the in-memory [`SoftwareAuthenticator`], or a scripted fake.
//!
//! # Lifecycle
//!
//! ```text
//! register ──> finish_register(config blob)       (once per device)
//!
//! start_auth(device_id, device nonce) ──> AuthAttempt
//!     └──> finish_auth(attempt, hmac_dk, hmac_sk) (once per attempt)
//! ```
//!
//! Stage changes of the host's sign-in UI arrive on a broadcast stream
//! obtained from [`Authenticator::subscribe_stages`]. Dropping the receiver
//! unsubscribes.

mod software;

pub use software::{Policy, SoftwareAuthenticator};

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::crypto::{DeviceConfig, KeyMaterial};
use crate::error::Result;

/// Capabilities a companion device declares at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCapability {
    /// Device stores its keys in secure storage
    SecureStorage,
    /// Host may store keys on behalf of the device
    StoreKeys,
    /// Device asks the user before authenticating
    ConfirmUserIntentToAuthenticate,
    /// Device checks user presence securely
    SupportSecureUserPresenceCheck,
    /// Link encrypts transmitted data
    TransmittedDataIsEncrypted,
    /// Device computes HMAC-SHA256
    HMacSha256,
}

/// Result of [`Authenticator::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Registration may be finished with the configuration blob
    Started,
    /// The user canceled
    CanceledByUser,
    /// User has no PIN configured
    PinSetupRequired,
    /// Companion sign-in disabled by policy
    DisabledByPolicy,
    /// Any other failure
    Failed,
}

/// Result of [`Authenticator::start_auth`] when no attempt was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    /// Attempt started
    Started,
    /// Device id is not registered
    UnknownDevice,
    /// Companion sign-in disabled by policy
    DisabledByPolicy,
    /// The sign-in UI is not collecting credentials
    InvalidAuthenticationStage,
    /// Any other failure
    Failed,
}

/// Result of [`Authenticator::finish_auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishStatus {
    /// Authenticators verified, host unlocks
    Completed,
    /// Policy forbids unlocking now
    UnlockNotAllowed,
    /// Attempt outlived its nonce lifetime
    NonceExpired,
    /// Authenticators did not verify, or the attempt is unknown
    Failed,
}

macro_rules! display_as_debug {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{self:?}")
            }
        })*
    };
}

display_as_debug!(RegistrationStatus, AuthStatus, FinishStatus);

/// Which registrations [`Authenticator::list_registered_devices`] returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindScope {
    /// Devices registered by the current user
    #[default]
    User,
    /// Devices registered by any user of this host
    AllUsers,
}

/// A registered companion device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Identifier assigned at registration
    pub device_id: String,
    /// Name reported by the device
    pub friendly_name: String,
    /// Model reported by the device
    pub model_number: String,
    /// When registration finished
    pub registered_at: DateTime<Utc>,
}

/// Stage of the host's sign-in flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStage {
    /// Nothing in progress
    NotStarted,
    /// Waiting for the user to dismiss the lock screen
    WaitingForUserConfirmation,
    /// Host wants the companion device's credential now
    CollectingCredential,
    /// Attempt suspended
    SuspendingAuthentication,
    /// Credential received
    CredentialCollected,
    /// Credential verified
    CredentialAuthenticated,
    /// Host is done; companions should stop
    StoppingAuthentication,
    /// Host is about to lock
    ReadyForLock,
}

/// Why the sign-in flow is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScenario {
    /// Lock screen sign-in
    #[default]
    SignIn,
    /// Credential prompt inside a session
    CredentialPrompt,
}

/// One stage-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEvent {
    /// New stage
    pub stage: AuthStage,
    /// Scenario the stage belongs to
    pub scenario: AuthScenario,
}

impl StageEvent {
    /// Sign-in scenario event
    pub fn sign_in(stage: AuthStage) -> Self {
        Self {
            stage,
            scenario: AuthScenario::SignIn,
        }
    }
}

/// Everything needed to register one companion device.
#[derive(Debug)]
pub struct RegistrationRequest {
    /// Fresh identifier for the device
    pub device_id: String,
    /// Declared capability set
    pub capabilities: Vec<DeviceCapability>,
    /// Name reported by the device
    pub device_name: String,
    /// Model reported by the device
    pub device_model: String,
    /// Shared device key
    pub device_key: KeyMaterial,
    /// Shared auth key
    pub auth_key: KeyMaterial,
}

/// An in-flight authentication attempt.
///
/// The three byte strings are opaque to the host protocol engine; they are
/// forwarded to the device in `REQUEST_MAC`.
#[derive(Debug, Clone)]
pub struct AuthAttempt {
    /// Handle used by [`Authenticator::finish_auth`]
    pub attempt_id: Uuid,
    /// Device being authenticated
    pub device_id: String,
    /// Host-computed service HMAC
    pub service_hmac: Vec<u8>,
    /// Session nonce
    pub session_nonce: Vec<u8>,
    /// Device nonce
    pub device_nonce: Vec<u8>,
}

/// Result of [`Authenticator::start_auth`].
#[derive(Debug, Clone)]
pub enum AuthStart {
    /// Attempt started
    Started(AuthAttempt),
    /// Attempt refused
    Rejected(AuthStatus),
}

/// The host authentication subsystem.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Begin registering a companion device.
    async fn register(&self, request: RegistrationRequest) -> Result<RegistrationStatus>;

    /// Hand the subsystem the device configuration blob.
    async fn finish_register(&self, device_id: &str, config: DeviceConfig) -> Result<()>;

    /// Enumerate registered devices.
    async fn list_registered_devices(&self, scope: FindScope) -> Result<Vec<DeviceInfo>>;

    /// Start an attempt for `device_id` seeded with the device's nonce.
    async fn start_auth(&self, device_id: &str, nonce: &[u8]) -> Result<AuthStart>;

    /// Present the device's authenticators for an attempt.
    async fn finish_auth(
        &self,
        attempt: &AuthAttempt,
        hmac_dk: &[u8],
        hmac_sk: &[u8],
    ) -> Result<FinishStatus>;

    /// Remove a registration.
    async fn unregister(&self, device_id: &str) -> Result<()>;

    /// Subscribe to stage changes.
    fn subscribe_stages(&self) -> broadcast::Receiver<StageEvent>;
}
