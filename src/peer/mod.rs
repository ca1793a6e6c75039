//! Companion-device side of the protocol.
//!
//! A [`CompanionPeer`] answers the host's requests from a fixed
//! [`PeerIdentity`]: it hands out its keys on `REQUEST_KEYS`, a fresh nonce on
//! `REQUEST_NONCE`, and on `REQUEST_MAC` checks the host's service HMAC before
//! returning its two authenticators. A host that cannot produce the service
//! HMAC gets no answer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::crypto::{
    compute_chain, generate_nonce, verify_service, KeyMaterial, DEFAULT_KEY_SIZE, NONCE_SIZE,
};
use crate::error::{ProtocolError, ProximityError, Result, TransportError};
use crate::protocol::{
    Command, HMacRequest, HMacResponse, NonceResponse, RegisterDeviceResponse, Request,
};
use crate::transport::{AsyncStream, Connection, FlowSignal, FrameHandler, FrameSender};

/// Keys and descriptive fields of a companion device.
#[derive(Debug, Clone)]
pub struct PeerIdentity {
    /// Name reported at registration
    pub device_name: String,
    /// Model reported at registration
    pub device_model: String,
    device_key: KeyMaterial,
    auth_key: KeyMaterial,
}

impl PeerIdentity {
    /// Identity with the given keys
    pub fn new(
        device_name: impl Into<String>,
        device_model: impl Into<String>,
        device_key: KeyMaterial,
        auth_key: KeyMaterial,
    ) -> Self {
        Self {
            device_name: device_name.into(),
            device_model: device_model.into(),
            device_key,
            auth_key,
        }
    }

    /// Identity with freshly generated keys
    pub fn generate(device_name: impl Into<String>, device_model: impl Into<String>) -> Self {
        Self::new(
            device_name,
            device_model,
            KeyMaterial::generate(DEFAULT_KEY_SIZE),
            KeyMaterial::generate(DEFAULT_KEY_SIZE),
        )
    }

    /// Device key
    pub fn device_key(&self) -> &KeyMaterial {
        &self.device_key
    }

    /// Auth key
    pub fn auth_key(&self) -> &KeyMaterial {
        &self.auth_key
    }
}

/// Requests answered by one peer connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerStats {
    /// `REQUEST_KEYS` answered
    pub keys_served: u32,
    /// `REQUEST_NONCE` answered
    pub nonces_served: u32,
    /// `REQUEST_MAC` answered
    pub macs_served: u32,
    /// Requests dropped
    pub rejected: u32,
}

/// Frame handler answering host requests.
pub struct CompanionPeer {
    identity: Arc<PeerIdentity>,
    sender: FrameSender,
    service_nonce: Option<Vec<u8>>,
    check_service_hmac: bool,
    stats: PeerStats,
}

impl CompanionPeer {
    /// Create a peer bound to `connection`
    pub fn new(identity: Arc<PeerIdentity>, connection: &Connection) -> Self {
        Self {
            identity,
            sender: connection.sender(),
            service_nonce: None,
            check_service_hmac: true,
            stats: PeerStats::default(),
        }
    }

    /// Answer `REQUEST_MAC` without checking the host's service HMAC.
    pub fn without_service_check(mut self) -> Self {
        self.check_service_hmac = false;
        self
    }

    /// Requests answered so far
    pub fn stats(&self) -> PeerStats {
        self.stats
    }

    async fn answer(&mut self, payload: &str) -> Result<()> {
        match Request::decode(payload)? {
            Request::Keys(_) => {
                let reply = RegisterDeviceResponse::new(
                    &self.identity.device_key,
                    &self.identity.auth_key,
                    self.identity.device_name.clone(),
                    self.identity.device_model.clone(),
                );
                self.sender.send_message(&reply).await?;
                self.stats.keys_served += 1;
            }
            Request::Nonce(_) => {
                let nonce = generate_nonce(NONCE_SIZE);
                self.sender.send_message(&NonceResponse::new(&nonce)).await?;
                self.service_nonce = Some(nonce);
                self.stats.nonces_served += 1;
            }
            Request::Mac(request) => {
                let reply = self.authenticators(&request)?;
                self.sender.send_message(&reply).await?;
                self.stats.macs_served += 1;
            }
        }
        Ok(())
    }

    fn authenticators(&mut self, request: &HMacRequest) -> Result<HMacResponse> {
        let (service_hmac, session_nonce, device_nonce) = request.decode_fields()?;
        let service_nonce = self
            .service_nonce
            .take()
            .ok_or(ProtocolError::UnexpectedCommand(Command::RequestMac))?;

        if self.check_service_hmac {
            verify_service(
                &self.identity.auth_key,
                &service_nonce,
                &device_nonce,
                &session_nonce,
                &service_hmac,
            )
            .map_err(|_| ProtocolError::ServiceHmacMismatch)?;
        }

        let chain = compute_chain(
            &self.identity.device_key,
            &self.identity.auth_key,
            &device_nonce,
            &session_nonce,
        )?;
        Ok(HMacResponse::new(&chain))
    }
}

#[async_trait]
impl FrameHandler for CompanionPeer {
    async fn handle_frame(&mut self, payload: &str) -> Result<()> {
        let result = self.answer(payload).await;
        if result.is_err() {
            self.stats.rejected += 1;
        }
        result
    }
}

/// Serve one host connection until the host hangs up.
pub async fn serve<S: AsyncStream + 'static>(
    stream: S,
    identity: Arc<PeerIdentity>,
    max_frame_len: usize,
) -> Result<PeerStats> {
    let connection = Connection::new(stream, max_frame_len);
    let mut peer = CompanionPeer::new(identity, &connection);

    match connection.run(&mut peer).await {
        Ok(()) | Err(ProximityError::Transport(TransportError::Disconnected)) => Ok(peer.stats()),
        Err(e) => Err(e),
    }
}

/// Accept host connections on `listener` until `shutdown` completes.
pub async fn serve_tcp(
    listener: TcpListener,
    identity: Arc<PeerIdentity>,
    max_frame_len: usize,
    shutdown: FlowSignal,
) -> Result<()> {
    tracing::info!("Companion listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = tokio::select! {
            () = shutdown.completed() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        stream.set_nodelay(true)?;
        tracing::info!("Host connected from {}", addr);

        let identity = Arc::clone(&identity);
        tokio::spawn(async move {
            match serve(stream, identity, max_frame_len).await {
                Ok(stats) => tracing::info!(?stats, "Host {} disconnected", addr),
                Err(e) => tracing::warn!("Connection from {} failed: {}", addr, e),
            }
        });
    }
}
