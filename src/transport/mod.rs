//! Byte-stream transport to the companion device.
//!
//! The protocol only needs a reliable, ordered, point-to-point byte stream
//! keyed by the proximity service UUID. A [`Connector`] opens one; the
//! [`Connection`] then owns it, splits it into a serialized write half and a
//! receive loop that owns the read half.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   open(endpoint, level)   ┌──────────────────┐
//! │  Connector   │ ─────────────────────────▶│   BoxedStream    │
//! │ (RFCOMM/TCP) │                           └────────┬─────────┘
//! └──────────────┘                                    │ split
//!                                     ┌───────────────┴──────────────┐
//!                                     ▼                              ▼
//!                           ┌──────────────────┐          ┌───────────────────┐
//!                           │   FrameReader    │          │   FrameSender     │
//!                           │ (receive loop)   │          │ (Mutex<WriteHalf>)│
//!                           └────────┬─────────┘          └───────────────────┘
//!                                    │ handle_frame(text)
//!                                    ▼
//!                              FrameHandler
//! ```
//!
//! # Frame Format
//!
//! | Part       | Content                                  |
//! |------------|------------------------------------------|
//! | payload    | base64 (standard, padded) of UTF-8 JSON  |
//! | terminator | `\n` when sending; `\n` or `\r` accepted |

mod config;
mod framer;
mod sdp;
mod tcp;

pub use config::{TransportConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_FRAME_LEN};
pub use framer::{
    decode_frame, encode_frame, Connection, FlowSignal, FrameHandler, FrameSender,
};
pub use sdp::{
    ServiceDescriptor, ServiceRecord, SERVICE_NAME, SERVICE_NAME_ATTRIBUTE_ID,
    SERVICE_NAME_ATTRIBUTE_TYPE, SERVICE_VERSION_ATTRIBUTE_ID, SERVICE_VERSION_ATTRIBUTE_TYPE,
};
pub use tcp::TcpConnector;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::error::{Result, TransportError};

/// Proximity service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4e5d48e0_75df_11e3_981f_0800200c9a66);

/// Minimum service version accepted when version checking is enabled
pub const MIN_SERVICE_VERSION: u32 = 200;

/// Link protection, weakest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionLevel {
    /// No link-level protection
    #[default]
    PlainSocket,
    /// Encrypted link, pairing may be unauthenticated
    BluetoothEncryptionAllowNullAuthentication,
    /// Encrypted link with authenticated pairing
    BluetoothEncryptionWithAuthentication,
}

impl ProtectionLevel {
    /// Config string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlainSocket => "plain_socket",
            Self::BluetoothEncryptionAllowNullAuthentication => {
                "bluetooth_encryption_allow_null_authentication"
            }
            Self::BluetoothEncryptionWithAuthentication => {
                "bluetooth_encryption_with_authentication"
            }
        }
    }
}

impl fmt::Display for ProtectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtectionLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "plain_socket" | "plain" => Ok(Self::PlainSocket),
            "bluetooth_encryption_allow_null_authentication" | "encrypted" => {
                Ok(Self::BluetoothEncryptionAllowNullAuthentication)
            }
            "bluetooth_encryption_with_authentication" | "authenticated" => {
                Ok(Self::BluetoothEncryptionWithAuthentication)
            }
            _ => Err(format!("Unknown protection level: {s}")),
        }
    }
}

/// Where the companion device's service lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Connector-specific address (Bluetooth address, `host:port`)
    pub address: String,
    /// Service advertised at the address
    pub service_id: Uuid,
    /// Strongest protection the remote side supports
    pub max_protection: ProtectionLevel,
}

impl Endpoint {
    /// Proximity service endpoint at `address`
    pub fn new(address: impl Into<String>, max_protection: ProtectionLevel) -> Self {
        Self {
            address: address.into(),
            service_id: SERVICE_UUID,
            max_protection,
        }
    }
}

/// A connected duplex byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased connected stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens byte streams to a remote service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Strongest protection this side can provide.
    fn max_protection(&self) -> ProtectionLevel;

    /// Open a stream at the negotiated protection level.
    async fn open(&self, endpoint: &Endpoint, level: ProtectionLevel) -> Result<BoxedStream>;

    /// Connector name for logging.
    fn name(&self) -> &'static str;
}

/// Pick the strongest level both sides support, or fail if it is below `required`.
pub fn negotiate_protection(
    local: ProtectionLevel,
    remote: ProtectionLevel,
    required: ProtectionLevel,
) -> std::result::Result<ProtectionLevel, TransportError> {
    let available = local.min(remote);
    if available < required {
        return Err(TransportError::ProtectionMismatch {
            required,
            available,
        });
    }
    Ok(available)
}

/// Open a [`Connection`] to `endpoint`.
///
/// The receive loop is not started; callers send their first request and then
/// hand the connection to [`Connection::run`].
pub async fn connect(
    connector: &dyn Connector,
    endpoint: &Endpoint,
    config: &TransportConfig,
) -> Result<Connection> {
    if endpoint.service_id != config.service_uuid {
        return Err(TransportError::ServiceNotFound(format!(
            "{} advertises {}, expected {}",
            endpoint.address, endpoint.service_id, config.service_uuid
        ))
        .into());
    }

    let level = negotiate_protection(
        connector.max_protection(),
        endpoint.max_protection,
        config.min_protection,
    )?;

    let timeout = config.connect_timeout();
    let stream = tokio::time::timeout(timeout, connector.open(endpoint, level))
        .await
        .map_err(|_| TransportError::ConnectTimeout(timeout))??;

    tracing::info!(
        connector = connector.name(),
        address = %endpoint.address,
        protection = %level,
        "Connected to companion device"
    );
    Ok(Connection::new(stream, config.max_frame_len))
}
