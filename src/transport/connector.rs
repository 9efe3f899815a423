//! Byte-stream connectors.
//!
//! The session manager owns exactly one connection at a time but never
//! dials it directly: a [`Connector`] produces a fresh, ready-to-use byte
//! stream per attempt. This is the seam for TLS (a caller-built
//! `rustls::ClientConfig`), WebSocket tunnels, and in-process test streams.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tracing::debug;

/// Anything the session can treat as an ordered, reliable byte stream.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Resolved broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Whether the URL scheme asked for TLS (`mqtts://`).
    pub tls: bool,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Produces one fresh byte stream per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn ByteStream>>;
}

/// Plain TCP.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn ByteStream>> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        stream.set_nodelay(true)?;
        debug!(endpoint = %endpoint, "TCP stream established");
        Ok(Box::new(stream))
    }
}

/// TCP + TLS via a caller-supplied `rustls` configuration.
///
/// Certificate and key material stays with the caller; this connector only
/// performs the handshake on an already-validated configuration.
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<Box<dyn ByteStream>> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let connector = tokio_rustls::TlsConnector::from(self.config.clone());
        let stream = connector.connect(server_name, tcp).await?;
        debug!(endpoint = %endpoint, "TLS stream established");
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint {
            host: "broker.example.com".to_string(),
            port: 8883,
            tls: true,
        };
        assert_eq!(endpoint.to_string(), "broker.example.com:8883");
    }

    #[tokio::test]
    async fn test_tcp_connector_against_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let endpoint = Endpoint {
            host: addr.ip().to_string(),
            port: addr.port(),
            tls: false,
        };

        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = TcpConnector.connect(&endpoint).await;
        assert!(stream.is_ok(), "connect to local listener should succeed");
        assert!(accept.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // Port 1 on localhost is essentially never listening.
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port: 1,
            tls: false,
        };
        assert!(TcpConnector.connect(&endpoint).await.is_err());
    }
}
