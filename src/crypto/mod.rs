//! Cryptographic primitives for companion-device authentication.
//!
//! The host and the companion device share two symmetric secrets established
//! at registration time:
//!
//! - **device key**: authenticates the device nonce
//! - **auth key**: authenticates the session
//!
//! Both sides independently compute the HMAC chain below from the shared keys
//! and the nonces exchanged in plaintext. Equality of the two authenticator
//! pairs proves possession of the keys.
//!
//! ```text
//! hmac_dk = HMAC-SHA256(device_key, device_nonce)
//! hmac_sk = HMAC-SHA256(auth_key,   hmac_dk || session_nonce)
//! ```
//!
//! The host additionally proves itself to the device with
//!
//! ```text
//! srv_hmac = HMAC-SHA256(auth_key, service_nonce || device_nonce || session_nonce)
//! ```
//!
//! where `service_nonce` is the nonce the device sent in `REQUEST_NONCE_REPLY`.
//!
//! # Device Configuration Blob
//!
//! The subsystem stores the keys as one opaque blob: `device_key || auth_key`,
//! no separator, no length prefix. Swapping the order silently corrupts every
//! later authenticator computation, so [`DeviceConfig::combine`] is the only
//! constructor used by the registration path.

mod hmac_chain;
mod keys;

pub use hmac_chain::{
    compute_chain, device_authenticator, service_authenticator, session_authenticator,
    verify_chain, verify_service, Authenticators, Tag,
};
pub use keys::{generate_nonce, DeviceConfig, KeyMaterial};

use thiserror::Error;

/// HMAC-SHA256 tag size (256 bits)
pub const HMAC_TAG_SIZE: usize = 32;

/// Size of nonces generated on this side of the protocol (256 bits)
pub const NONCE_SIZE: usize = 32;

/// Default size of each shared key generated for a companion device
pub const DEFAULT_KEY_SIZE: usize = 32;

/// Errors from key handling and HMAC verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material unusable as an HMAC key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Authenticator did not match the expected value
    #[error("HMAC verification failed")]
    VerificationFailed,

    /// Configuration blob cannot be split at the recorded key length
    #[error("Malformed device configuration: {len} bytes, device key length {device_key_len}")]
    MalformedConfig {
        /// Blob length
        len: usize,
        /// Recorded device key length
        device_key_len: usize,
    },
}
