use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use skein_common::config::{self, keys, ConfigSource};
use skein_common::transport::{
    BoxedStream, Formats, FrameCodec, Transport, TransportListener, DEFAULT_MAX_FRAME_BYTES,
};
use skein_common::{
    MessageBody, MessageType, ResponseCode, Result, RpcError, RpcMessage, RpcRequest, RpcResponse,
    ServiceAddress, ServiceKey,
};
use skein_registry::ServiceRegistry;
use tokio::io::WriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::service::{ServiceDefinition, ServiceTable};
use crate::worker::WorkerPool;

/// Responses buffered per connection before handlers wait on the writer.
const OUTBOUND_QUEUE: usize = 1024;

/// Server configuration.
///
/// # Default Configuration
///
/// - `bind`: `0.0.0.0:9998`
/// - `advertise_host`: unset, derived from the bound address
/// - `idle_timeout`: 30 seconds without an inbound frame closes a connection
/// - `worker_threads`: 100 concurrent handlers
/// - `max_frame_bytes`: 8 MiB
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Host published to the registry. When unset the bound IP is used,
    /// or `127.0.0.1` if the server is bound to an unspecified address.
    pub advertise_host: Option<String>,
    pub idle_timeout: Duration,
    pub worker_threads: usize,
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9998".to_string(),
            advertise_host: None,
            idle_timeout: Duration::from_secs(30),
            worker_threads: 100,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ServerConfig {
    /// Reads the `rpc.server.*` and `rpc.codec.*` keys, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` for unparseable numbers.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            bind: config::read_string(source, keys::SERVER_BIND, &defaults.bind),
            advertise_host: config::read_optional(source, keys::SERVER_ADVERTISE_HOST),
            idle_timeout: config::read_millis(source, keys::SERVER_IDLE_TIMEOUT_MS, defaults.idle_timeout)?,
            worker_threads: config::read_usize(source, keys::SERVER_WORKER_THREADS, defaults.worker_threads)?,
            max_frame_bytes: config::read_usize(
                source,
                keys::CODEC_MAX_FRAME_BYTES,
                defaults.max_frame_bytes,
            )?,
        })
    }
}

struct ServerInner {
    listener: Mutex<Option<Box<dyn TransportListener>>>,
    local_addr: SocketAddr,
    service_address: ServiceAddress,
    services: ServiceTable,
    registry: Option<ServiceRegistry>,
    codec: FrameCodec,
    workers: WorkerPool,
    connections: TaskTracker,
    shutdown: CancellationToken,
    config: ServerConfig,
}

/// Serves published services over the frame protocol.
///
/// Each connection gets a reader task and a writer task. Requests are
/// dispatched on the [`WorkerPool`] and answered in completion order, so one
/// connection carries many concurrent calls. Heartbeat pings are answered
/// on the reader task without touching service code.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Binds the listening socket on `transport`.
    ///
    /// When `registry` is given, [`publish`](Self::publish) also registers the
    /// service there and [`shutdown`](Self::shutdown) removes it again.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Connection` if the address cannot be bound.
    pub async fn bind(
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        formats: Arc<Formats>,
        registry: Option<ServiceRegistry>,
    ) -> Result<Self> {
        let listener = transport.bind(&config.bind).await?;
        let local_addr = listener.local_addr()?;
        let service_address = advertise_address(config.advertise_host.as_deref(), local_addr);

        info!(
            bind = %local_addr,
            advertise = %service_address,
            transport = transport.name(),
            "Server bound"
        );

        Ok(Self {
            inner: Arc::new(ServerInner {
                listener: Mutex::new(Some(listener)),
                local_addr,
                service_address,
                services: ServiceTable::new(),
                registry,
                codec: FrameCodec::new(formats, config.max_frame_bytes),
                workers: WorkerPool::new(config.worker_threads),
                connections: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                config,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The address published to the registry.
    pub fn service_address(&self) -> &ServiceAddress {
        &self.inner.service_address
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn services(&self) -> &ServiceTable {
        &self.inner.services
    }

    /// Handlers running.
    pub fn active_handlers(&self) -> usize {
        self.inner.workers.in_flight()
    }

    /// Makes `definition` callable under `service` and registers this server
    /// as a provider of it.
    ///
    /// # Errors
    ///
    /// - `Config` if the service key is invalid
    /// - any registry error from publishing the provider entry
    pub async fn publish(&self, service: ServiceKey, definition: ServiceDefinition) -> Result<()> {
        service.validate()?;
        info!(service = %service, methods = definition.len(), "Publishing service");
        self.inner.services.insert(service.clone(), definition);
        if let Some(registry) = &self.inner.registry {
            registry.publish(&service, &self.inner.service_address).await?;
        }
        Ok(())
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Server` if the server is already running.
    pub async fn run(&self) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or_else(|| RpcError::Server("server is already running".to_string()))?;
        self.inner.clone().accept_loop(listener).await;
        Ok(())
    }

    /// Runs the accept loop on a background task.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Server` if the server is already running.
    pub fn spawn(&self) -> Result<JoinHandle<()>> {
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or_else(|| RpcError::Server("server is already running".to_string()))?;
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move { inner.accept_loop(listener).await }))
    }

    /// Stops accepting, lets in-flight handlers finish and flush their
    /// responses, then removes this server's registry entries.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        info!(addr = %inner.service_address, "Shutting down server");
        inner.shutdown.cancel();
        inner.listener.lock().take();

        inner.workers.shutdown().await;
        inner.connections.close();
        inner.connections.wait().await;

        if let Some(registry) = &inner.registry {
            registry.unpublish_all(&inner.service_address).await;
        }
        info!(addr = %inner.service_address, "Server stopped");
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: Box<dyn TransportListener>) {
        info!(addr = %self.local_addr, "Accepting connections");
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Connection established");
                    let inner = self.clone();
                    self.connections
                        .spawn(async move { inner.serve_connection(stream, peer).await });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            }
        }
        debug!(addr = %self.local_addr, "Accept loop stopped");
    }

    async fn serve_connection(self: Arc<Self>, stream: BoxedStream, peer: SocketAddr) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, self.codec.clone());
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, self.codec.clone()),
            queue,
            peer,
        ));

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = tokio::time::timeout(self.config.idle_timeout, frames.next()) => next,
            };
            let message = match next {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    warn!(peer = %peer, error = %e, "Closing connection after bad frame");
                    break;
                }
                Ok(None) => {
                    debug!(peer = %peer, "Client closed the connection");
                    break;
                }
                Err(_) => {
                    info!(peer = %peer, idle_ms = self.config.idle_timeout.as_millis() as u64, "Closing idle connection");
                    break;
                }
            };

            match (message.message_type, message.body) {
                (MessageType::HeartbeatPing, _) => {
                    trace!(peer = %peer, "Heartbeat");
                    let pong = RpcMessage::pong(message.serializer, message.compressor);
                    if outbound.send(pong).await.is_err() {
                        break;
                    }
                }
                (MessageType::Request, MessageBody::Request(request)) => {
                    // waits for a free worker, so a flood stops reading the socket
                    let submitted = self
                        .submit(request, message.serializer, message.compressor, outbound.clone())
                        .await;
                    if let Err(e) = submitted {
                        warn!(peer = %peer, error = %e, "Dropping request");
                        break;
                    }
                }
                (message_type, _) => {
                    debug!(peer = %peer, ?message_type, "Ignoring unexpected frame");
                }
            }
        }

        // the writer ends once every handler holding a sender has replied
        drop(outbound);
        let _ = writer.await;
    }

    async fn submit(
        &self,
        request: RpcRequest,
        serializer: u8,
        compressor: u8,
        outbound: mpsc::Sender<RpcMessage>,
    ) -> Result<()> {
        let services = self.services.clone();
        self.workers.spawn(async move {
            let request_id = request.request_id.clone();
            let response = match AssertUnwindSafe(services.dispatch(request)).catch_unwind().await {
                Ok(response) => response,
                Err(_) => {
                    warn!(request_id = %request_id, "Method panicked");
                    RpcResponse::fail(request_id, ResponseCode::Fail, "method panicked")
                }
            };
            let _ = outbound
                .send(RpcMessage::response(response, serializer, compressor))
                .await;
        })
        .await
    }
}

async fn write_loop(
    mut sink: FramedWrite<WriteHalf<BoxedStream>, FrameCodec>,
    mut queue: mpsc::Receiver<RpcMessage>,
    peer: SocketAddr,
) {
    while let Some(message) = queue.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!(peer = %peer, error = %e, "Failed to write frame");
            return;
        }
    }
    let _ = sink.close().await;
}

fn advertise_address(advertise_host: Option<&str>, local_addr: SocketAddr) -> ServiceAddress {
    let host = match advertise_host {
        Some(host) => host.to_string(),
        None if local_addr.ip().is_unspecified() => "127.0.0.1".to_string(),
        None => local_addr.ip().to_string(),
    };
    ServiceAddress::new(host, local_addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_common::transport::TcpTransport;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind, "0.0.0.0:9998");
        assert_eq!(config.advertise_host, None);
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.worker_threads, 100);
    }

    #[test]
    fn test_config_from_source() {
        let mut source = HashMap::new();
        source.insert(keys::SERVER_BIND.to_string(), "127.0.0.1:0".to_string());
        source.insert(keys::SERVER_ADVERTISE_HOST.to_string(), "10.1.2.3".to_string());
        source.insert(keys::SERVER_WORKER_THREADS.to_string(), "8".to_string());

        let config = ServerConfig::from_source(&source).unwrap();
        assert_eq!(config.bind, "127.0.0.1:0");
        assert_eq!(config.advertise_host.as_deref(), Some("10.1.2.3"));
        assert_eq!(config.worker_threads, 8);
    }

    #[test]
    fn test_advertise_address() {
        let unspecified: SocketAddr = "0.0.0.0:9998".parse().unwrap();
        assert_eq!(advertise_address(None, unspecified).to_string(), "127.0.0.1:9998");

        let bound: SocketAddr = "10.0.0.5:7000".parse().unwrap();
        assert_eq!(advertise_address(None, bound).to_string(), "10.0.0.5:7000");
        assert_eq!(
            advertise_address(Some("rpc.internal"), bound).to_string(),
            "rpc.internal:7000"
        );
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = RpcServer::bind(config, Arc::new(TcpTransport), Arc::new(Formats::builtin()), None).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.service_address().port, server.local_addr().port());
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = RpcServer::bind(config, Arc::new(TcpTransport), Arc::new(Formats::builtin()), None).await.unwrap();
        let handle = server.spawn().unwrap();
        assert!(matches!(server.spawn(), Err(RpcError::Server(_))));

        server.shutdown().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_rejects_invalid_key() {
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let server = RpcServer::bind(config, Arc::new(TcpTransport), Arc::new(Formats::builtin()), None).await.unwrap();
        let result = server.publish(ServiceKey::new(""), ServiceDefinition::new()).await;
        assert!(result.is_err());
        assert!(server.services().is_empty());
    }
}
