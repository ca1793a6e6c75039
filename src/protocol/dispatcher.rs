//! Host-side handshake engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::message::{
    Command, HMacRequest, HMacResponse, NonceRequest, NonceResponse, RegisterDeviceRequest,
    RegisterDeviceResponse, Reply,
};
use super::session::{Session, SessionOutcome, SessionSelection};
use crate::auth::{
    AuthStart, Authenticator, DeviceCapability, FindScope, FinishStatus, RegistrationRequest,
    RegistrationStatus,
};
use crate::crypto::DeviceConfig;
use crate::error::{AuthenticationError, ProtocolError, RegistrationError, Result};
use crate::transport::{Connection, FlowSignal, FrameHandler, FrameSender};

/// Interprets replies from the companion device and emits the next request.
///
/// One dispatcher serves one connection. It either registers a new device
/// (`REQUEST_KEYS`) or authenticates the selected one (`REQUEST_NONCE`), and
/// completes the connection's flow when done.
pub struct Dispatcher {
    authenticator: Arc<dyn Authenticator>,
    sender: FrameSender,
    flow: FlowSignal,
    selection: Option<SessionSelection>,
    attempt_ttl: Duration,
    session: Session,
    outcome: Option<SessionOutcome>,
}

impl Dispatcher {
    /// Create a dispatcher bound to `connection`.
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        connection: &Connection,
        selection: Option<SessionSelection>,
        attempt_ttl: Duration,
    ) -> Self {
        Self {
            authenticator,
            sender: connection.sender(),
            flow: connection.flow(),
            selection,
            attempt_ttl,
            session: Session::new(),
            outcome: None,
        }
    }

    /// Protocol state
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Device this dispatcher authenticates
    pub fn selection(&self) -> Option<&SessionSelection> {
        self.selection.as_ref()
    }

    /// Start registration: send `REQUEST_KEYS`.
    pub async fn request_keys(&mut self) -> Result<()> {
        self.session.keys_requested()?;
        tracing::info!(session = %self.session.id(), "Requesting keys");
        self.sender.send_message(&RegisterDeviceRequest::default()).await
    }

    /// Start authentication: send `REQUEST_NONCE`.
    pub async fn request_nonce(&mut self) -> Result<()> {
        self.session.nonce_requested()?;
        tracing::info!(session = %self.session.id(), "Requesting nonce");
        self.sender.send_message(&NonceRequest::default()).await
    }

    /// Handle one decoded payload.
    pub async fn dispatch(&mut self, payload: &str) -> Result<()> {
        let reply = Reply::decode(payload)?;
        tracing::debug!(session = %self.session.id(), command = %reply.command(), "Dispatching reply");

        let result = match reply {
            Reply::Keys(reply) => self.on_keys_reply(&reply).await,
            Reply::Nonce(reply) => self.on_nonce_reply(&reply).await,
            Reply::Mac(reply) => self.on_mac_reply(&reply).await,
        };

        if let Err(e) = &result {
            if !e.is_recoverable() {
                tracing::error!(session = %self.session.id(), "Session failed: {}", e);
                self.session.fail();
            }
        }
        result
    }

    async fn on_keys_reply(&mut self, reply: &RegisterDeviceResponse) -> Result<()> {
        let (device_key, auth_key) = reply.keys()?;
        self.session.accept_reply(Command::RequestKeysReply)?;
        self.session.keys_consumed();

        // Order matters: the subsystem splits the blob at the device key length.
        let config = DeviceConfig::combine(&device_key, &auth_key);
        let device_id = Uuid::new_v4().to_string();
        let request = RegistrationRequest {
            device_id: device_id.clone(),
            capabilities: vec![DeviceCapability::SecureStorage],
            device_name: reply.device_name.clone(),
            device_model: reply.device_model.clone(),
            device_key,
            auth_key,
        };

        let status = self.authenticator.register(request).await?;
        if status != RegistrationStatus::Started {
            return Err(RegistrationError::from(status).into());
        }
        self.authenticator.finish_register(&device_id, config).await?;

        let devices = self
            .authenticator
            .list_registered_devices(FindScope::User)
            .await?;
        tracing::info!(
            device_id = %device_id,
            name = %reply.device_name,
            registered = devices.len(),
            "Companion device registered"
        );

        self.session.registered();
        self.outcome = Some(SessionOutcome::Registered {
            device_id,
            device_name: reply.device_name.clone(),
        });
        self.flow.complete();
        Ok(())
    }

    async fn on_nonce_reply(&mut self, reply: &NonceResponse) -> Result<()> {
        let nonce = reply.nonce_bytes()?;
        self.session.accept_reply(Command::RequestNonceReply)?;

        let device_id = self
            .selection
            .as_ref()
            .map(|s| s.device_id.clone())
            .ok_or(AuthenticationError::NoDeviceSelected)?;

        let attempt = match self.authenticator.start_auth(&device_id, &nonce).await? {
            AuthStart::Started(attempt) => attempt,
            AuthStart::Rejected(status) => {
                return Err(AuthenticationError::NotStarted(status).into());
            }
        };

        let request = HMacRequest::from_attempt(&attempt);
        self.session.attempt_started(attempt);
        self.sender.send_message(&request).await?;
        self.session.mac_requested();
        tracing::debug!(device_id = %device_id, "MAC requested");
        Ok(())
    }

    async fn on_mac_reply(&mut self, reply: &HMacResponse) -> Result<()> {
        let (hmac_dk, hmac_sk) = reply.decode_tags()?;
        self.session.accept_reply(Command::RequestMacReply)?;

        let in_flight = self
            .session
            .attempt()
            .cloned()
            .ok_or(ProtocolError::NoAuthenticationInProgress)?;

        let elapsed = in_flight.age();
        if elapsed > self.attempt_ttl {
            return Err(AuthenticationError::Expired {
                elapsed,
                ttl: self.attempt_ttl,
            }
            .into());
        }

        let status = self
            .authenticator
            .finish_auth(&in_flight.attempt, &hmac_dk, &hmac_sk)
            .await?;
        if status != FinishStatus::Completed {
            return Err(AuthenticationError::NotCompleted(status).into());
        }

        tracing::info!(device_id = %in_flight.attempt.device_id, "Companion device authenticated");
        self.session.authenticated();
        self.outcome = Some(SessionOutcome::Authenticated {
            device_id: in_flight.attempt.device_id,
        });
        self.flow.complete();
        Ok(())
    }

    /// Outcome once the receive loop has returned `result`.
    pub fn finish(self, result: Result<()>) -> SessionOutcome {
        match (self.outcome, result) {
            (Some(outcome), _) => outcome,
            (None, Err(e)) => SessionOutcome::from_error(&e),
            (None, Ok(())) => SessionOutcome::Cancelled,
        }
    }
}

#[async_trait]
impl FrameHandler for Dispatcher {
    async fn handle_frame(&mut self, payload: &str) -> Result<()> {
        self.dispatch(payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SoftwareAuthenticator;
    use crate::transport::decode_frame;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_request_nonce_frame() {
        let (local, remote) = duplex(1024);
        let connection = Connection::new(local, 1024);
        let mut dispatcher = Dispatcher::new(
            Arc::new(SoftwareAuthenticator::new()),
            &connection,
            None,
            Duration::from_secs(30),
        );

        dispatcher.request_nonce().await.unwrap();
        assert!(dispatcher.request_nonce().await.is_err());

        let mut line = String::new();
        BufReader::new(remote).read_line(&mut line).await.unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(
            decode_frame(line.trim_end().as_bytes()).unwrap(),
            r#"{"request_command":"REQUEST_NONCE"}"#
        );
    }

    #[tokio::test]
    async fn test_nonce_reply_without_selection() {
        let (local, _remote) = duplex(1024);
        let connection = Connection::new(local, 1024);
        let mut dispatcher = Dispatcher::new(
            Arc::new(SoftwareAuthenticator::new()),
            &connection,
            None,
            Duration::from_secs(30),
        );
        dispatcher.request_nonce().await.unwrap();

        let reply = serde_json::to_string(&NonceResponse::new(b"nonce")).unwrap();
        let err = dispatcher.dispatch(&reply).await.unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(
            dispatcher.session().auth_state(),
            super::super::AuthState::Failed
        );
        assert!(matches!(
            dispatcher.finish(Err(err)),
            SessionOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_finish_without_outcome() {
        let (local, _remote) = duplex(64);
        let connection = Connection::new(local, 64);
        let dispatcher = Dispatcher::new(
            Arc::new(SoftwareAuthenticator::new()),
            &connection,
            None,
            Duration::from_secs(30),
        );
        assert_eq!(dispatcher.finish(Ok(())), SessionOutcome::Cancelled);
    }
}
