//! Transport configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ProtectionLevel, SERVICE_UUID};
use crate::error::{ProximityError, Result};

/// Default bound on accumulated frame bytes before a terminator
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connect and framing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Service the remote device must advertise
    pub service_uuid: Uuid,
    /// Weakest link protection accepted
    pub min_protection: ProtectionLevel,
    /// Minimum advertised service version; unchecked when absent
    pub min_service_version: Option<u32>,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Maximum frame length in bytes
    pub max_frame_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            min_protection: ProtectionLevel::PlainSocket,
            min_service_version: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl TransportConfig {
    /// Require an authenticated, encrypted link.
    pub fn secure() -> Self {
        Self {
            min_protection: ProtectionLevel::BluetoothEncryptionWithAuthentication,
            min_service_version: Some(super::MIN_SERVICE_VERSION),
            ..Self::default()
        }
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Reject settings the receive loop cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_len == 0 {
            return Err(ProximityError::Config(
                "transport.max_frame_len must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(
            config.service_uuid.to_string(),
            "4e5d48e0-75df-11e3-981f-0800200c9a66"
        );
        assert_eq!(config.max_frame_len, 65536);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.min_service_version.is_none());
    }

    #[test]
    fn test_secure_profile() {
        let config = TransportConfig::secure();
        assert_eq!(
            config.min_protection,
            ProtectionLevel::BluetoothEncryptionWithAuthentication
        );
        assert_eq!(config.min_service_version, Some(200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_frame_len_rejected() {
        let config = TransportConfig {
            max_frame_len: 0,
            ..TransportConfig::default()
        };
        assert!(matches!(config.validate(), Err(ProximityError::Config(_))));

        let config = TransportConfig {
            max_frame_len: 1,
            ..TransportConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
