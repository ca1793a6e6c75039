//! # btProximity - Bluetooth Proximity Unlock
//!
//! Host-side engine that unlocks a workstation when a registered companion
//! device (a phone) is nearby and answers an HMAC challenge over a Bluetooth
//! stream socket.
//!
//! ## Features
//!
//! - **Registration**: fetch a device key and auth key from the companion and
//!   hand them to the platform's companion-device authentication subsystem
//! - **Challenge-response unlock**: nonce exchange followed by a two-level
//!   HMAC-SHA256 chain the subsystem verifies
//! - **Line framing**: base64-encoded JSON frames, one per line
//! - **Stage-driven orchestration**: sessions start when the sign-in UI begins
//!   collecting a credential and stop when it stops authenticating
//! - **Companion simulator**: the device side of the protocol, served over TCP
//!
//! ## Protocol Overview
//!
//! ```text
//! Host                                              Companion
//!  |                                                    |
//!  |-- REQUEST_KEYS ----------------------------------->|   registration
//!  |<-- KEYS_REPLY (device_key, auth_key, name, model)--|
//!  |                                                    |
//!  |-- REQUEST_NONCE ---------------------------------->|   unlock
//!  |<-- NONCE_REPLY (service nonce) --------------------|
//!  |   start_auth(device, service nonce)                |
//!  |-- REQUEST_MAC (service hmac, session, device) ---->|
//!  |<-- MAC_REPLY (hmac_dk, hmac_sk) -------------------|
//!  |   finish_auth(hmac_dk, hmac_sk)                    |
//! ```
//!
//! Every frame is `base64(json) + "\n"`. The JSON object carries its command in
//! `request_command` (host to companion) or `response_command` (companion to
//! host).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use btproximity::{register_device, Config, SoftwareAuthenticator, TcpConnector};
//!
//! let authenticator = Arc::new(SoftwareAuthenticator::new());
//! let connector = TcpConnector::new();
//! let endpoint = TcpConnector::endpoint("127.0.0.1:4500");
//!
//! let outcome = register_device(authenticator, &connector, &endpoint, &Config::default()).await?;
//! assert!(outcome.is_success());
//! ```
//!
//! ## Modules
//!
//! - [`transport`]: Connectors, protection levels, framing and service records
//! - [`protocol`]: Message model, session state and reply dispatch
//! - [`crypto`]: Key material and the HMAC chain
//! - [`auth`]: Companion-device authentication subsystem interface
//! - [`device`]: Paired-device catalog and notifications
//! - [`orchestrator`]: Stage-driven unlock loop and registration
//! - [`peer`]: Companion-device side of the protocol
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod auth;
pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod peer;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use auth::{AuthStage, Authenticator, DeviceInfo, FindScope, SoftwareAuthenticator};
pub use config::{Config, SessionConfig};
pub use crypto::{DeviceConfig, KeyMaterial};
pub use device::{DeviceCatalog, LogNotifier, Notifier, StaticCatalog};
pub use error::{FailureKind, ProximityError, Result};
pub use orchestrator::{register_device, Orchestrator, RunSummary};
pub use peer::{CompanionPeer, PeerIdentity};
pub use protocol::{Dispatcher, Reply, Request, Session, SessionOutcome};
pub use transport::{
    Connection, Connector, Endpoint, ProtectionLevel, TcpConnector, TransportConfig, SERVICE_UUID,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
