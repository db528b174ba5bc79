//! Byte-stream transport: TCP connect, send/receive and in-place TLS upgrade.
//!
//! The engine talks to a [`Transport`] wrapping any boxed async stream, so
//! tests can hand it an in-memory duplex pipe through a custom [`Connector`].

pub mod dns;
pub mod tls;

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Result, XmppError};
use dns::{parse_server_input, resolve_xmpp_server, Endpoint, ServerTarget};

/// Receive buffer size for a single read.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Any bidirectional byte stream the engine can run over.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Opens the raw byte stream to the server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the server for `hostname`, using `port` where no SRV
    /// record or explicit server overrides it.
    async fn connect(&self, hostname: &str, port: u16) -> io::Result<BoxedIo>;
}

/// Plain TCP with optional SRV resolution, trying endpoints in order.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub server: Option<String>,
    pub resolve_srv: bool,
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            server: config.server.clone(),
            resolve_srv: config.resolve_srv,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    async fn endpoints(&self, hostname: &str, port: u16) -> Vec<Endpoint> {
        let target = match self.server.as_deref() {
            Some(server) => parse_server_input(server, port),
            None => ServerTarget::Domain(hostname.to_string()),
        };
        match target {
            ServerTarget::Direct(endpoint) => {
                info!(host = %endpoint.host, port = endpoint.port, "Using explicit endpoint");
                vec![endpoint]
            }
            ServerTarget::Domain(domain) if self.resolve_srv => resolve_xmpp_server(&domain, port).await,
            ServerTarget::Domain(domain) => vec![Endpoint::new(domain, port)],
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, hostname: &str, port: u16) -> io::Result<BoxedIo> {
        let mut last_error = None;
        for endpoint in self.endpoints(hostname, port).await {
            let started = Instant::now();
            let attempt = tokio::time::timeout(
                self.connect_timeout,
                TcpStream::connect(format!("{}:{}", endpoint.host, endpoint.port)),
            )
            .await;
            match attempt {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    info!(host = %endpoint.host, port = endpoint.port,
                        connect_ms = started.elapsed().as_millis() as u64, "Connected (TCP)");
                    return Ok(Box::new(stream));
                }
                Ok(Err(e)) => {
                    warn!(host = %endpoint.host, port = endpoint.port,
                        error = %e, error_kind = ?e.kind(), "TCP connect failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(host = %endpoint.host, port = endpoint.port,
                        timeout_secs = self.connect_timeout.as_secs(), "TCP connect timed out");
                    last_error = Some(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!(
                            "TCP connect timed out after {}s to {}:{}",
                            self.connect_timeout.as_secs(),
                            endpoint.host,
                            endpoint.port
                        ),
                    ));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no endpoint for {}", hostname))
        }))
    }
}

/// An open connection to the server.
pub struct Transport {
    io: Option<BoxedIo>,
    encrypted: bool,
}

fn closed() -> XmppError {
    XmppError::Disconnected("transport is closed".to_string())
}

impl Transport {
    pub fn new(io: BoxedIo) -> Self {
        Self {
            io: Some(io),
            encrypted: false,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Write all of `data` and flush.
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        let io = self.io.as_mut().ok_or_else(closed)?;
        io.write_all(data).await?;
        io.flush().await?;
        Ok(())
    }

    /// Read whatever is available. `Ok(0)` means the peer closed cleanly.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let io = self.io.as_mut().ok_or_else(closed)?;
        Ok(io.read(buf).await?)
    }

    /// Run a TLS handshake over the current stream and continue over it.
    ///
    /// On failure the underlying stream is gone and the transport is closed.
    pub async fn upgrade_to_encrypted(&mut self, validation_host: &str, insecure: bool) -> std::result::Result<(), String> {
        let io = self.io.take().ok_or_else(|| "transport is closed".to_string())?;
        let connector = tls::create_tls_connector(insecure)?;
        let server_name = ServerName::try_from(validation_host.to_string())
            .map_err(|e| format!("Invalid server name: {}", e))?;

        match connector.connect(server_name, io).await {
            Ok(stream) => {
                self.io = Some(Box::new(stream));
                self.encrypted = true;
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                let classification = tls::HandshakeFailure::classify(&detail);
                error!(host = validation_host, error = %e, error_class = %classification, "TLS handshake failed");
                Err(format!(
                    "TLS handshake failed with {} ({}): {}",
                    validation_host, classification, detail
                ))
            }
        }
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> Result<(ReadHalf<BoxedIo>, WriteHalf<BoxedIo>)> {
        let io = self.io.ok_or_else(closed)?;
        Ok(tokio::io::split(io))
    }

    pub async fn close(&mut self) {
        if let Some(mut io) = self.io.take() {
            let _ = io.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive_over_duplex() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut transport = Transport::new(Box::new(client));
        transport.send(b"<presence/>").await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<presence/>");

        server.write_all(b"<iq/>").await.unwrap();
        let n = transport.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"<iq/>");
        assert!(!transport.is_encrypted());
    }

    #[tokio::test]
    async fn test_receive_reports_clean_close() {
        let (client, server) = tokio::io::duplex(64);
        let mut transport = Transport::new(Box::new(client));
        drop(server);
        let mut buf = [0u8; 16];
        assert_eq!(transport.receive(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_use_after_close() {
        let (client, _server) = tokio::io::duplex(64);
        let mut transport = Transport::new(Box::new(client));
        transport.close().await;
        assert!(matches!(transport.send(b"x").await, Err(XmppError::Disconnected(_))));
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_transport() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let mut transport = Transport::new(Box::new(client));
        let err = transport.upgrade_to_encrypted("example.com", true).await.unwrap_err();
        assert!(err.contains("example.com"));
        assert!(!transport.is_encrypted());
        assert!(transport.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_connector_direct_endpoint() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let connector = TcpConnector {
            server: Some(format!("tcp://127.0.0.1:{}", addr.port())),
            resolve_srv: true,
            connect_timeout: Duration::from_secs(5),
        };
        assert!(connector.connect("example.com", 5222).await.is_ok());
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = TcpConnector {
            server: Some(format!("127.0.0.1:{}", port)),
            resolve_srv: false,
            connect_timeout: Duration::from_secs(5),
        };
        assert!(connector.connect("example.com", 5222).await.is_err());
    }
}
