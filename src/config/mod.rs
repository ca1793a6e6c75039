//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`BTPROXIMITY_*`)
//! - CLI arguments (for the binary)
//!
//! ```toml
//! [transport]
//! min_protection = "bluetooth_encryption_with_authentication"
//! min_service_version = 200
//! connect_timeout_secs = 10
//! max_frame_len = 65536
//!
//! [session]
//! session_timeout_secs = 60
//! attempt_ttl_secs = 30
//! startup_scope = "all_users"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::FindScope;
use crate::error::{ProximityError, Result};
use crate::transport::TransportConfig;

/// Main configuration struct
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Connect and framing settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Session bounds
    #[serde(default)]
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProximityError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that parse but cannot be used
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(level) = lookup("BTPROXIMITY_MIN_PROTECTION") {
            match level.parse() {
                Ok(level) => config.transport.min_protection = level,
                Err(e) => tracing::warn!("Ignoring BTPROXIMITY_MIN_PROTECTION: {}", e),
            }
        }
        if let Some(val) = lookup("BTPROXIMITY_MIN_SERVICE_VERSION") {
            if let Ok(val) = val.parse() {
                config.transport.min_service_version = Some(val);
            }
        }
        if let Some(val) = lookup("BTPROXIMITY_CONNECT_TIMEOUT_SECS") {
            if let Ok(val) = val.parse() {
                config.transport.connect_timeout_secs = val;
            }
        }
        if let Some(val) = lookup("BTPROXIMITY_MAX_FRAME_LEN") {
            match val.parse() {
                Ok(0) => tracing::warn!("Ignoring BTPROXIMITY_MAX_FRAME_LEN: must be at least 1"),
                Ok(val) => config.transport.max_frame_len = val,
                Err(_) => {}
            }
        }

        if let Some(val) = lookup("BTPROXIMITY_SESSION_TIMEOUT_SECS") {
            if let Ok(val) = val.parse() {
                config.session.session_timeout_secs = val;
            }
        }
        if let Some(val) = lookup("BTPROXIMITY_ATTEMPT_TTL_SECS") {
            if let Ok(val) = val.parse() {
                config.session.attempt_ttl_secs = val;
            }
        }

        config
    }

    /// Default config file location (`<config dir>/btproximity/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("btproximity").join("config.toml"))
    }

    /// Merge with another config (other takes precedence where it differs
    /// from the defaults)
    pub fn merge(self, other: Self) -> Self {
        let transport_default = TransportConfig::default();
        let session_default = SessionConfig::default();

        Self {
            transport: TransportConfig {
                service_uuid: pick(
                    self.transport.service_uuid,
                    other.transport.service_uuid,
                    transport_default.service_uuid,
                ),
                min_protection: pick(
                    self.transport.min_protection,
                    other.transport.min_protection,
                    transport_default.min_protection,
                ),
                min_service_version: other
                    .transport
                    .min_service_version
                    .or(self.transport.min_service_version),
                connect_timeout_secs: pick(
                    self.transport.connect_timeout_secs,
                    other.transport.connect_timeout_secs,
                    transport_default.connect_timeout_secs,
                ),
                max_frame_len: pick(
                    self.transport.max_frame_len,
                    other.transport.max_frame_len,
                    transport_default.max_frame_len,
                ),
            },
            session: SessionConfig {
                session_timeout_secs: pick(
                    self.session.session_timeout_secs,
                    other.session.session_timeout_secs,
                    session_default.session_timeout_secs,
                ),
                attempt_ttl_secs: pick(
                    self.session.attempt_ttl_secs,
                    other.session.attempt_ttl_secs,
                    session_default.attempt_ttl_secs,
                ),
                startup_scope: pick(
                    self.session.startup_scope,
                    other.session.startup_scope,
                    session_default.startup_scope,
                ),
            },
        }
    }
}

fn pick<T: PartialEq>(base: T, other: T, default: T) -> T {
    if other == default {
        base
    } else {
        other
    }
}

/// Session bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound on one whole receive loop, in seconds
    pub session_timeout_secs: u64,

    /// Lifetime of an authentication attempt, in seconds
    pub attempt_ttl_secs: u64,

    /// Scope used to pick the device at startup
    pub startup_scope: FindScope,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 60,
            attempt_ttl_secs: 30,
            startup_scope: FindScope::AllUsers,
        }
    }
}

impl SessionConfig {
    /// Session timeout as a duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Attempt lifetime as a duration
    pub fn attempt_ttl(&self) -> Duration {
        Duration::from_secs(self.attempt_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ProtectionLevel;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.session.session_timeout(), Duration::from_secs(60));
        assert_eq!(config.session.attempt_ttl(), Duration::from_secs(30));
        assert_eq!(config.session.startup_scope, FindScope::AllUsers);
        assert_eq!(config.transport.min_protection, ProtectionLevel::PlainSocket);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [transport]
            min_protection = "bluetooth_encryption_with_authentication"
            min_service_version = 200

            [session]
            attempt_ttl_secs = 5
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(
            config.transport.min_protection,
            ProtectionLevel::BluetoothEncryptionWithAuthentication
        );
        assert_eq!(config.transport.min_service_version, Some(200));
        assert_eq!(config.transport.max_frame_len, 65536);
        assert_eq!(config.session.attempt_ttl_secs, 5);
        assert_eq!(config.session.session_timeout_secs, 60);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session]\nsession_timeout_secs = 7").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.session.session_timeout_secs, 7);

        assert!(matches!(
            Config::from_file("/nonexistent/btproximity.toml"),
            Err(ProximityError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[session\nsession_timeout_secs = ").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ProximityError::Config(_))
        ));
    }

    #[test]
    fn test_zero_frame_len_file_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[transport]\nmax_frame_len = 0").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(ProximityError::Config(_))
        ));

        let config = Config::from_lookup(|key| match key {
            "BTPROXIMITY_MAX_FRAME_LEN" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.transport.max_frame_len, 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_lookup() {
        let config = Config::from_lookup(|key| match key {
            "BTPROXIMITY_MIN_PROTECTION" => Some("authenticated".to_string()),
            "BTPROXIMITY_ATTEMPT_TTL_SECS" => Some("12".to_string()),
            "BTPROXIMITY_MAX_FRAME_LEN" => Some("not a number".to_string()),
            _ => None,
        });
        assert_eq!(
            config.transport.min_protection,
            ProtectionLevel::BluetoothEncryptionWithAuthentication
        );
        assert_eq!(config.session.attempt_ttl_secs, 12);
        assert_eq!(config.transport.max_frame_len, 65536);
    }

    #[test]
    fn test_merge_prefers_non_default() {
        let mut file_config = Config::default();
        file_config.session.attempt_ttl_secs = 10;
        file_config.transport.connect_timeout_secs = 3;

        let mut env_config = Config::default();
        env_config.session.attempt_ttl_secs = 20;

        let merged = file_config.merge(env_config);
        assert_eq!(merged.session.attempt_ttl_secs, 20);
        assert_eq!(merged.transport.connect_timeout_secs, 3);
    }

    #[test]
    fn test_default_path() {
        if let Some(path) = Config::default_path() {
            assert!(path.ends_with("btproximity/config.toml"));
        }
    }
}
