//! TCP stand-in for the RFCOMM stream.
//!
//! Lets the whole protocol run over localhost (tests, the `demo` command)
//! or across a LAN to a simulated companion device. TCP offers no link
//! protection, so it can only satisfy [`ProtectionLevel::PlainSocket`].

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{BoxedStream, Connector, Endpoint, ProtectionLevel};
use crate::error::{Result, TransportError};

/// Connector opening plain TCP streams to `host:port` endpoints.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    nodelay: bool,
}

impl TcpConnector {
    /// Create a connector with Nagle disabled.
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Endpoint for a companion device listening at `addr`
    pub fn endpoint(addr: impl std::fmt::Display) -> Endpoint {
        Endpoint::new(addr.to_string(), ProtectionLevel::PlainSocket)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn max_protection(&self) -> ProtectionLevel {
        ProtectionLevel::PlainSocket
    }

    async fn open(&self, endpoint: &Endpoint, level: ProtectionLevel) -> Result<BoxedStream> {
        tracing::debug!("Opening TCP stream to {} ({})", endpoint.address, level);

        let stream = TcpStream::connect(&endpoint.address)
            .await
            .map_err(|e| TransportError::Unreachable(format!("{}: {}", endpoint.address, e)))?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "TCP"
    }
}
