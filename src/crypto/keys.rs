//! Shared key material and the device configuration blob.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::CryptoError;

/// Secret key bytes, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Wrap raw key bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Decode key bytes from their wire (base64) form.
    pub fn from_base64(encoded: &str) -> Result<Self, base64::DecodeError> {
        STANDARD.decode(encoded).map(Self::new)
    }

    /// Generate `len` random key bytes from the system CSPRNG.
    pub fn generate(len: usize) -> Self {
        Self::new(generate_nonce(len))
    }

    /// Encode for the wire.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([REDACTED, {} bytes])", self.bytes.len())
    }
}

/// Opaque per-device configuration handed to the subsystem at registration:
/// `device_key || auth_key`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DeviceConfig {
    bytes: Vec<u8>,
}

impl DeviceConfig {
    /// Concatenate device key bytes followed by auth key bytes.
    pub fn combine(device_key: &KeyMaterial, auth_key: &KeyMaterial) -> Self {
        let mut bytes = Vec::with_capacity(device_key.len() + auth_key.len());
        bytes.extend_from_slice(device_key.as_bytes());
        bytes.extend_from_slice(auth_key.as_bytes());
        Self { bytes }
    }

    /// Wrap an already-combined blob.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Split back into `(device_key, auth_key)`.
    pub fn split(&self, device_key_len: usize) -> Result<(KeyMaterial, KeyMaterial), CryptoError> {
        if device_key_len == 0 || device_key_len >= self.bytes.len() {
            return Err(CryptoError::MalformedConfig {
                len: self.bytes.len(),
                device_key_len,
            });
        }
        let (device_key, auth_key) = self.bytes.split_at(device_key_len);
        Ok((
            KeyMaterial::new(device_key.to_vec()),
            KeyMaterial::new(auth_key.to_vec()),
        ))
    }

    /// Raw blob bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Blob length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the blob is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceConfig([REDACTED, {} bytes])", self.bytes.len())
    }
}

/// Fresh random bytes from the system CSPRNG.
pub fn generate_nonce(len: usize) -> Vec<u8> {
    let mut nonce = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_orders_device_key_first() {
        let device_key = KeyMaterial::new(vec![0u8; 16]);
        let auth_key = KeyMaterial::new(vec![1u8; 16]);

        let config = DeviceConfig::combine(&device_key, &auth_key);
        assert_eq!(config.len(), 32);
        assert_eq!(&config.as_bytes()[..16], &[0u8; 16]);
        assert_eq!(&config.as_bytes()[16..], &[1u8; 16]);

        let (dk, ak) = config.split(16).unwrap();
        assert_eq!(dk.as_bytes(), device_key.as_bytes());
        assert_eq!(ak.as_bytes(), auth_key.as_bytes());
    }

    #[test]
    fn test_split_rejects_bad_length() {
        let config = DeviceConfig::from_bytes(vec![7u8; 8]);
        assert!(config.split(0).is_err());
        assert!(config.split(8).is_err());
        assert!(config.split(12).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = KeyMaterial::new(vec![0xAB; 32]);
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
    }

    #[test]
    fn test_base64_key() {
        let key = KeyMaterial::from_base64("AQEBAQEBAQEBAQEBAQEBAQ==").unwrap();
        assert_eq!(key.as_bytes(), &[1u8; 16]);
        assert_eq!(key.to_base64(), "AQEBAQEBAQEBAQEBAQEBAQ==");
        assert!(KeyMaterial::from_base64("not base64!").is_err());
    }
}
