//! In-memory authentication subsystem.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::{
    AuthAttempt, AuthStage, AuthStart, AuthStatus, Authenticator, DeviceCapability, DeviceInfo,
    FindScope, FinishStatus, RegistrationRequest, RegistrationStatus, StageEvent,
};
use crate::crypto::{
    generate_nonce, service_authenticator, verify_chain, CryptoError, DeviceConfig, NONCE_SIZE,
};
use crate::error::{RegistrationError, Result};

/// Stage broadcast buffer
const STAGE_CHANNEL_CAPACITY: usize = 16;

/// Default attempt lifetime
const DEFAULT_ATTEMPT_TTL: Duration = Duration::from_secs(30);

/// Host policy switches consulted on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    /// Companion-device sign-in allowed at all
    pub enabled: bool,
    /// The current user has a PIN
    pub pin_configured: bool,
    /// Unlocking allowed once authenticators verify
    pub unlock_allowed: bool,
    /// Refuse `start_auth` unless the sign-in UI is collecting credentials
    pub require_collecting_stage: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            enabled: true,
            pin_configured: true,
            unlock_allowed: true,
            require_collecting_stage: false,
        }
    }
}

struct PendingRegistration {
    device_name: String,
    device_model: String,
    device_key_len: usize,
    auth_key_len: usize,
    owner: String,
    started: Instant,
}

struct RegisteredDevice {
    info: DeviceInfo,
    config: DeviceConfig,
    device_key_len: usize,
    owner: String,
}

struct PendingAttempt {
    device_id: String,
    device_nonce: Vec<u8>,
    session_nonce: Vec<u8>,
    started: Instant,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, PendingRegistration>,
    devices: HashMap<String, RegisteredDevice>,
    attempts: HashMap<Uuid, PendingAttempt>,
    stage: Option<AuthStage>,
}

impl State {
    /// Drop registrations and attempts that were never finished within `ttl`.
    fn prune(&mut self, ttl: Duration) {
        let (pending, attempts) = (self.pending.len(), self.attempts.len());
        self.pending.retain(|_, p| p.started.elapsed() <= ttl);
        self.attempts.retain(|_, a| a.started.elapsed() <= ttl);

        let dropped = pending - self.pending.len() + attempts - self.attempts.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Pruned stale registrations and attempts");
        }
    }
}

/// Software implementation of [`Authenticator`].
///
/// Stores configuration blobs in memory, issues single-use attempts with a
/// bounded lifetime and verifies the HMAC chain in constant time.
pub struct SoftwareAuthenticator {
    state: RwLock<State>,
    policy: RwLock<Policy>,
    current_user: String,
    attempt_ttl: Duration,
    stages: broadcast::Sender<StageEvent>,
}

impl Default for SoftwareAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareAuthenticator {
    /// Create an authenticator with the default policy
    pub fn new() -> Self {
        let (stages, _) = broadcast::channel(STAGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            policy: RwLock::new(Policy::default()),
            current_user: "local".to_string(),
            attempt_ttl: DEFAULT_ATTEMPT_TTL,
            stages,
        }
    }

    /// Set the initial policy
    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = RwLock::new(policy);
        self
    }

    /// Set the user owning new registrations
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.current_user = user.into();
        self
    }

    /// Set the attempt lifetime
    pub fn with_attempt_ttl(mut self, ttl: Duration) -> Self {
        self.attempt_ttl = ttl;
        self
    }

    /// Replace the policy
    pub async fn set_policy(&self, policy: Policy) {
        *self.policy.write().await = policy;
    }

    /// Last published stage
    pub async fn current_stage(&self) -> Option<AuthStage> {
        self.state.read().await.stage
    }

    /// Number of attempts started and not yet finished
    pub async fn pending_attempts(&self) -> usize {
        self.state.read().await.attempts.len()
    }

    /// Publish a sign-in stage to all subscribers.
    ///
    /// Returns the number of subscribers that received it.
    pub async fn publish_stage(&self, stage: AuthStage) -> usize {
        self.state.write().await.stage = Some(stage);
        let delivered = self.stages.send(StageEvent::sign_in(stage)).unwrap_or(0);
        tracing::debug!(?stage, delivered, "Published authentication stage");
        delivered
    }
}

#[async_trait]
impl Authenticator for SoftwareAuthenticator {
    async fn register(&self, request: RegistrationRequest) -> Result<RegistrationStatus> {
        let policy = *self.policy.read().await;
        if !policy.enabled {
            return Ok(RegistrationStatus::DisabledByPolicy);
        }
        if !policy.pin_configured {
            return Ok(RegistrationStatus::PinSetupRequired);
        }
        if request.device_key.is_empty() || request.auth_key.is_empty() {
            tracing::warn!(device_id = %request.device_id, "Registration with empty key rejected");
            return Ok(RegistrationStatus::Failed);
        }
        if !request.capabilities.contains(&DeviceCapability::SecureStorage) {
            tracing::debug!(device_id = %request.device_id, "Device does not declare secure storage");
        }

        let mut state = self.state.write().await;
        state.prune(self.attempt_ttl);
        if state.devices.contains_key(&request.device_id) {
            return Ok(RegistrationStatus::Failed);
        }
        state.pending.insert(
            request.device_id.clone(),
            PendingRegistration {
                device_name: request.device_name.clone(),
                device_model: request.device_model.clone(),
                device_key_len: request.device_key.len(),
                auth_key_len: request.auth_key.len(),
                owner: self.current_user.clone(),
                started: Instant::now(),
            },
        );

        tracing::info!(device_id = %request.device_id, name = %request.device_name, "Registration started");
        Ok(RegistrationStatus::Started)
    }

    async fn finish_register(&self, device_id: &str, config: DeviceConfig) -> Result<()> {
        let mut state = self.state.write().await;
        let pending = state
            .pending
            .remove(device_id)
            .ok_or_else(|| RegistrationError::UnknownDevice(device_id.to_string()))?;

        if config.len() != pending.device_key_len + pending.auth_key_len {
            return Err(CryptoError::MalformedConfig {
                len: config.len(),
                device_key_len: pending.device_key_len,
            }
            .into());
        }

        let info = DeviceInfo {
            device_id: device_id.to_string(),
            friendly_name: pending.device_name,
            model_number: pending.device_model,
            registered_at: Utc::now(),
        };
        state.devices.insert(
            device_id.to_string(),
            RegisteredDevice {
                info,
                config,
                device_key_len: pending.device_key_len,
                owner: pending.owner,
            },
        );

        tracing::info!(device_id, "Registration finished");
        Ok(())
    }

    async fn list_registered_devices(&self, scope: FindScope) -> Result<Vec<DeviceInfo>> {
        let state = self.state.read().await;
        let mut devices: Vec<DeviceInfo> = state
            .devices
            .values()
            .filter(|d| scope == FindScope::AllUsers || d.owner == self.current_user)
            .map(|d| d.info.clone())
            .collect();
        devices.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });
        Ok(devices)
    }

    async fn start_auth(&self, device_id: &str, nonce: &[u8]) -> Result<AuthStart> {
        let policy = *self.policy.read().await;
        if !policy.enabled {
            return Ok(AuthStart::Rejected(AuthStatus::DisabledByPolicy));
        }

        let mut state = self.state.write().await;
        state.prune(self.attempt_ttl);
        if policy.require_collecting_stage && state.stage != Some(AuthStage::CollectingCredential) {
            return Ok(AuthStart::Rejected(AuthStatus::InvalidAuthenticationStage));
        }
        let Some(device) = state.devices.get(device_id) else {
            return Ok(AuthStart::Rejected(AuthStatus::UnknownDevice));
        };

        let (_, auth_key) = device.config.split(device.device_key_len)?;
        let device_nonce = generate_nonce(NONCE_SIZE);
        let session_nonce = generate_nonce(NONCE_SIZE);
        let service_hmac = service_authenticator(&auth_key, nonce, &device_nonce, &session_nonce)?;

        let attempt = AuthAttempt {
            attempt_id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            service_hmac: service_hmac.to_vec(),
            session_nonce: session_nonce.clone(),
            device_nonce: device_nonce.clone(),
        };
        state.attempts.insert(
            attempt.attempt_id,
            PendingAttempt {
                device_id: device_id.to_string(),
                device_nonce,
                session_nonce,
                started: Instant::now(),
            },
        );

        tracing::info!(device_id, attempt_id = %attempt.attempt_id, "Authentication started");
        Ok(AuthStart::Started(attempt))
    }

    async fn finish_auth(
        &self,
        attempt: &AuthAttempt,
        hmac_dk: &[u8],
        hmac_sk: &[u8],
    ) -> Result<FinishStatus> {
        let policy = *self.policy.read().await;
        let status = {
            let mut state = self.state.write().await;
            // Attempts are single-use: a replayed reply finds nothing.
            let Some(pending) = state.attempts.remove(&attempt.attempt_id) else {
                tracing::warn!(attempt_id = %attempt.attempt_id, "Unknown or consumed attempt");
                return Ok(FinishStatus::Failed);
            };

            if pending.started.elapsed() > self.attempt_ttl {
                FinishStatus::NonceExpired
            } else if let Some(device) = state.devices.get(&pending.device_id) {
                let (device_key, auth_key) = device.config.split(device.device_key_len)?;
                match verify_chain(
                    &device_key,
                    &auth_key,
                    &pending.device_nonce,
                    &pending.session_nonce,
                    hmac_dk,
                    hmac_sk,
                ) {
                    Ok(()) if policy.unlock_allowed => FinishStatus::Completed,
                    Ok(()) => FinishStatus::UnlockNotAllowed,
                    Err(CryptoError::VerificationFailed) => FinishStatus::Failed,
                    Err(e) => return Err(e.into()),
                }
            } else {
                FinishStatus::Failed
            }
        };

        tracing::info!(attempt_id = %attempt.attempt_id, %status, "Authentication finished");
        if status == FinishStatus::Completed {
            self.publish_stage(AuthStage::CredentialAuthenticated).await;
            self.publish_stage(AuthStage::StoppingAuthentication).await;
        }
        Ok(status)
    }

    async fn unregister(&self, device_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .devices
            .remove(device_id)
            .ok_or_else(|| RegistrationError::UnknownDevice(device_id.to_string()))?;
        state.attempts.retain(|_, a| a.device_id != device_id);
        tracing::info!(device_id, "Device unregistered");
        Ok(())
    }

    fn subscribe_stages(&self) -> broadcast::Receiver<StageEvent> {
        self.stages.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{compute_chain, verify_service, KeyMaterial};
    use crate::error::ProximityError;

    fn request(device_id: &str) -> RegistrationRequest {
        RegistrationRequest {
            device_id: device_id.to_string(),
            capabilities: vec![DeviceCapability::SecureStorage],
            device_name: "Phone".to_string(),
            device_model: "Model 1".to_string(),
            device_key: KeyMaterial::new(vec![0x11; 32]),
            auth_key: KeyMaterial::new(vec![0x22; 32]),
        }
    }

    async fn registered(auth: &SoftwareAuthenticator, device_id: &str) {
        let req = request(device_id);
        let config = DeviceConfig::combine(&req.device_key, &req.auth_key);
        assert_eq!(auth.register(req).await.unwrap(), RegistrationStatus::Started);
        auth.finish_register(device_id, config).await.unwrap();
    }

    async fn started(auth: &SoftwareAuthenticator, device_id: &str, nonce: &[u8]) -> AuthAttempt {
        match auth.start_auth(device_id, nonce).await.unwrap() {
            AuthStart::Started(attempt) => attempt,
            AuthStart::Rejected(status) => panic!("rejected: {status}"),
        }
    }

    fn answer(attempt: &AuthAttempt) -> (Vec<u8>, Vec<u8>) {
        let chain = compute_chain(
            &KeyMaterial::new(vec![0x11; 32]),
            &KeyMaterial::new(vec![0x22; 32]),
            &attempt.device_nonce,
            &attempt.session_nonce,
        )
        .unwrap();
        (chain.hmac_dk.to_vec(), chain.hmac_sk.to_vec())
    }

    #[tokio::test]
    async fn test_policy_gates_registration() {
        let auth = SoftwareAuthenticator::new().with_policy(Policy {
            enabled: false,
            ..Policy::default()
        });
        assert_eq!(
            auth.register(request("a")).await.unwrap(),
            RegistrationStatus::DisabledByPolicy
        );

        auth.set_policy(Policy {
            pin_configured: false,
            ..Policy::default()
        })
        .await;
        assert_eq!(
            auth.register(request("a")).await.unwrap(),
            RegistrationStatus::PinSetupRequired
        );
    }

    #[tokio::test]
    async fn test_finish_register_requires_pending() {
        let auth = SoftwareAuthenticator::new();
        let err = auth
            .finish_register("ghost", DeviceConfig::from_bytes(vec![1; 64]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProximityError::Registration(RegistrationError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_list_scopes() {
        let auth = SoftwareAuthenticator::new().with_user("alice");
        registered(&auth, "d1").await;

        assert_eq!(auth.list_registered_devices(FindScope::User).await.unwrap().len(), 1);
        assert_eq!(
            auth.list_registered_devices(FindScope::AllUsers).await.unwrap()[0].friendly_name,
            "Phone"
        );

        let other = SoftwareAuthenticator::new().with_user("bob");
        registered(&other, "d2").await;
        other.state.write().await.devices.get_mut("d2").unwrap().owner = "alice".to_string();
        assert!(other.list_registered_devices(FindScope::User).await.unwrap().is_empty());
        assert_eq!(other.list_registered_devices(FindScope::AllUsers).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_attempt() {
        let auth = SoftwareAuthenticator::new();
        registered(&auth, "d1").await;

        let service_nonce = [0x44u8; 32];
        let attempt = started(&auth, "d1", &service_nonce).await;
        verify_service(
            &KeyMaterial::new(vec![0x22; 32]),
            &service_nonce,
            &attempt.device_nonce,
            &attempt.session_nonce,
            &attempt.service_hmac,
        )
        .unwrap();

        let mut stages = auth.subscribe_stages();
        let (dk, sk) = answer(&attempt);
        assert_eq!(auth.finish_auth(&attempt, &dk, &sk).await.unwrap(), FinishStatus::Completed);
        assert_eq!(stages.recv().await.unwrap().stage, AuthStage::CredentialAuthenticated);
        assert_eq!(stages.recv().await.unwrap().stage, AuthStage::StoppingAuthentication);
    }

    #[tokio::test]
    async fn test_attempt_single_use() {
        let auth = SoftwareAuthenticator::new();
        registered(&auth, "d1").await;

        let attempt = started(&auth, "d1", b"nonce").await;
        let (dk, sk) = answer(&attempt);
        assert_eq!(auth.finish_auth(&attempt, &dk, &sk).await.unwrap(), FinishStatus::Completed);
        assert_eq!(auth.finish_auth(&attempt, &dk, &sk).await.unwrap(), FinishStatus::Failed);
        assert_eq!(auth.pending_attempts().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_authenticators_fail() {
        let auth = SoftwareAuthenticator::new();
        registered(&auth, "d1").await;

        let attempt = started(&auth, "d1", b"nonce").await;
        let (dk, _) = answer(&attempt);
        assert_eq!(
            auth.finish_auth(&attempt, &dk, &[0u8; 32]).await.unwrap(),
            FinishStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_expired_attempt() {
        let auth = SoftwareAuthenticator::new().with_attempt_ttl(Duration::ZERO);
        registered(&auth, "d1").await;

        let attempt = started(&auth, "d1", b"nonce").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (dk, sk) = answer(&attempt);
        assert_eq!(
            auth.finish_auth(&attempt, &dk, &sk).await.unwrap(),
            FinishStatus::NonceExpired
        );
    }

    #[tokio::test]
    async fn test_unfinished_attempts_pruned() {
        let auth = SoftwareAuthenticator::new().with_attempt_ttl(Duration::from_millis(1));
        registered(&auth, "d1").await;

        for _ in 0..100 {
            started(&auth, "d1", b"nonce").await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        started(&auth, "d1", b"nonce").await;
        assert_eq!(auth.pending_attempts().await, 1);
    }

    #[tokio::test]
    async fn test_abandoned_registration_pruned() {
        let auth = SoftwareAuthenticator::new().with_attempt_ttl(Duration::from_millis(1));
        let abandoned = request("d1");
        let config = DeviceConfig::combine(&abandoned.device_key, &abandoned.auth_key);
        assert_eq!(auth.register(abandoned).await.unwrap(), RegistrationStatus::Started);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(auth.register(request("d2")).await.unwrap(), RegistrationStatus::Started);
        let err = auth.finish_register("d1", config).await.unwrap_err();
        assert!(matches!(
            err,
            ProximityError::Registration(RegistrationError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_start_auth_rejections() {
        let auth = SoftwareAuthenticator::new().with_policy(Policy {
            require_collecting_stage: true,
            ..Policy::default()
        });
        registered(&auth, "d1").await;

        assert!(matches!(
            auth.start_auth("nope", b"n").await.unwrap(),
            AuthStart::Rejected(AuthStatus::InvalidAuthenticationStage)
        ));
        auth.publish_stage(AuthStage::CollectingCredential).await;
        assert!(matches!(
            auth.start_auth("nope", b"n").await.unwrap(),
            AuthStart::Rejected(AuthStatus::UnknownDevice)
        ));
        assert!(matches!(
            auth.start_auth("d1", b"n").await.unwrap(),
            AuthStart::Started(_)
        ));
    }

    #[tokio::test]
    async fn test_unregister() {
        let auth = SoftwareAuthenticator::new();
        registered(&auth, "d1").await;
        auth.unregister("d1").await.unwrap();
        assert!(auth.list_registered_devices(FindScope::AllUsers).await.unwrap().is_empty());
        assert!(auth.unregister("d1").await.is_err());
    }
}
