//! Byte-stream transports carrying frames between client and server.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::extension::{Extension, ExtensionLoader};
use crate::protocol::error::{Result, RpcError};
use crate::protocol::ServiceAddress;

/// A connected, bidirectional byte stream.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TransportStream for T {}

pub type BoxedStream = Box<dyn TransportStream>;

/// Accepts inbound streams for a server.
#[async_trait]
pub trait TransportListener: Send + Sync {
    fn local_addr(&self) -> Result<SocketAddr>;

    async fn accept(&self) -> Result<(BoxedStream, SocketAddr)>;
}

/// Dials providers and listens for consumers.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    ///
    /// Returns `RpcError::Connection` if `addr` cannot be reached.
    async fn connect(&self, addr: &ServiceAddress) -> Result<BoxedStream>;

    /// # Errors
    ///
    /// Returns `RpcError::Connection` if `addr` cannot be bound.
    async fn bind(&self, addr: &str) -> Result<Box<dyn TransportListener>>;
}

impl Extension for dyn Transport {
    const CAPABILITY: &'static str = "transport";
    const DEFAULT_CONFIG: &'static str = "tcp=skein_common::transport::TcpTransport\n";
}

/// Registers the built-in transports in a loader's catalog.
pub fn register_builtin_transports(loader: &ExtensionLoader<dyn Transport>) {
    loader.register("skein_common::transport::TcpTransport", || Arc::new(TcpTransport));
}

/// Plain TCP with `TCP_NODELAY` set on every stream.
pub struct TcpTransport;

fn no_delay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn connect(&self, addr: &ServiceAddress) -> Result<BoxedStream> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
        no_delay(&stream);
        Ok(Box::new(stream))
    }

    async fn bind(&self, addr: &str) -> Result<Box<dyn TransportListener>> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", addr, e)))?;
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl TransportListener for TcpAcceptor {
    fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    async fn accept(&self) -> Result<(BoxedStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        no_delay(&stream);
        Ok((Box::new(stream), peer))
    }
}
