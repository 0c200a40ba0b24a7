use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use skein_common::transport::{BoxedStream, FrameCodec, Transport};
use skein_common::{MessageBody, MessageType, Result, RpcError, RpcMessage, ServiceAddress};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, OnceCell};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::pending::PendingRequests;

/// Outbound frames buffered per connection before senders wait.
const OUTBOUND_QUEUE: usize = 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection pool configuration.
///
/// # Default Configuration
///
/// - `connect_timeout`: 5 seconds
/// - `heartbeat_interval`: 5 seconds of write idleness before a ping
/// - `serializer` / `compressor`: ids used for heartbeat frames
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub serializer: u8,
    pub compressor: u8,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            serializer: skein_common::transport::JSON_SERIALIZER_ID,
            compressor: skein_common::transport::NO_COMPRESSION_ID,
        }
    }
}

/// A multiplexed connection to one provider.
///
/// Any number of calls share the connection: a writer task drains the
/// outbound queue and a reader task routes responses to the
/// [`PendingRequests`] table by request id. When either side ends, the
/// connection is closed and every call still in flight on it fails with
/// `ConnectionClosed`.
pub struct Connection {
    id: u64,
    addr: ServiceAddress,
    outbound: mpsc::Sender<RpcMessage>,
    closed: CancellationToken,
}

impl Connection {
    /// Dials `addr` and starts the reader and writer tasks.
    ///
    /// # Errors
    ///
    /// - `ConnectTimeout` if the dial does not complete within `config.connect_timeout`
    /// - `Connection` if the dial fails
    pub async fn open(
        addr: &ServiceAddress,
        transport: &dyn Transport,
        codec: FrameCodec,
        pending: Arc<PendingRequests>,
        config: &PoolConfig,
    ) -> Result<Arc<Self>> {
        let stream = tokio::time::timeout(config.connect_timeout, transport.connect(addr))
            .await
            .map_err(|_| RpcError::ConnectTimeout {
                addr: addr.to_string(),
                timeout_ms: config.connect_timeout.as_millis() as u64,
            })??;

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
        let connection = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr: addr.clone(),
            outbound,
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, codec.clone()),
            queue,
            connection.closed.clone(),
            config.clone(),
            addr.to_string(),
        ));
        tokio::spawn(read_loop(
            FramedRead::new(read_half, codec),
            connection.clone(),
            pending,
        ));

        info!(addr = %addr, connection_id = connection.id, "Connected to provider");
        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &ServiceAddress {
        &self.addr
    }

    /// Queues a frame for the writer task.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` if the connection is already closed.
    pub async fn send(&self, message: RpcMessage) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed(self.addr.to_string()));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| RpcError::ConnectionClosed(self.addr.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Completes when the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

async fn write_loop(
    mut sink: FramedWrite<WriteHalf<BoxedStream>, FrameCodec>,
    mut queue: mpsc::Receiver<RpcMessage>,
    closed: CancellationToken,
    config: PoolConfig,
    peer: String,
) {
    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = tokio::time::timeout(config.heartbeat_interval, queue.recv()) => next,
        };
        let message = match next {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => {
                trace!(addr = %peer, "Write idle, sending heartbeat");
                RpcMessage::ping(config.serializer, config.compressor)
            }
        };
        if let Err(e) = sink.send(message).await {
            warn!(addr = %peer, error = %e, "Failed to write frame");
            break;
        }
    }
    closed.cancel();
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: FramedRead<ReadHalf<BoxedStream>, FrameCodec>,
    connection: Arc<Connection>,
    pending: Arc<PendingRequests>,
) {
    let peer = connection.addr.to_string();
    loop {
        let frame = tokio::select! {
            _ = connection.closed.cancelled() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(message)) => match (message.message_type, message.body) {
                (MessageType::Response, MessageBody::Response(response)) => {
                    pending.complete(response);
                }
                (MessageType::HeartbeatPong, _) => trace!(addr = %peer, "Heartbeat acknowledged"),
                (message_type, _) => {
                    debug!(addr = %peer, ?message_type, "Ignoring unexpected frame");
                }
            },
            Some(Err(e)) => {
                warn!(addr = %peer, error = %e, "Closing connection after bad frame");
                break;
            }
            None => {
                info!(addr = %peer, "Provider closed the connection");
                break;
            }
        }
    }

    connection.close();
    let failed = pending.fail_connection(connection.id, &peer);
    if failed > 0 {
        warn!(addr = %peer, failed, "Failed in-flight calls on closed connection");
    }
}

/// One shared connection per provider address.
///
/// Connections are created lazily on first use. Concurrent first callers
/// for the same address wait on one dial. Closed connections are evicted,
/// and the next caller dials again.
pub struct ConnectionPool {
    connections: Arc<DashMap<ServiceAddress, Arc<OnceCell<Arc<Connection>>>>>,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingRequests>,
    codec: FrameCodec,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec: FrameCodec,
        pending: Arc<PendingRequests>,
        config: PoolConfig,
    ) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            transport,
            pending,
            codec,
            config,
        }
    }

    /// Returns the live connection to `addr`, dialing if there is none.
    ///
    /// # Errors
    ///
    /// Returns the dial error; the next call dials again.
    pub async fn acquire(&self, addr: &ServiceAddress) -> Result<Arc<Connection>> {
        loop {
            let cell = self.connections.entry(addr.clone()).or_default().value().clone();
            let connection = cell
                .get_or_try_init(|| self.open(addr))
                .await?
                .clone();
            if !connection.is_closed() {
                return Ok(connection);
            }
            self.connections
                .remove_if(addr, |_, current| Arc::ptr_eq(current, &cell));
        }
    }

    async fn open(&self, addr: &ServiceAddress) -> Result<Arc<Connection>> {
        let connection = Connection::open(
            addr,
            self.transport.as_ref(),
            self.codec.clone(),
            self.pending.clone(),
            &self.config,
        )
        .await?;

        // evict once closed, unless a newer connection already replaced it
        let connections = self.connections.clone();
        let watched = connection.clone();
        tokio::spawn(async move {
            watched.closed().await;
            connections.remove_if(watched.addr(), |_, cell| {
                cell.get().map_or(false, |current| Arc::ptr_eq(current, &watched))
            });
            debug!(addr = %watched.addr(), connection_id = watched.id(), "Connection evicted from pool");
        });

        Ok(connection)
    }

    /// Number of addresses with a live or dialing connection.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Closes every pooled connection.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            if let Some(connection) = entry.value().get() {
                connection.close();
            }
        }
        self.connections.clear();
    }
}
