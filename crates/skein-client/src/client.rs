use std::sync::Arc;
use std::time::Duration;

use skein_balance::{ActiveRequestRecorder, LoadBalancer};
use skein_common::config::{self, keys, ConfigSource};
use skein_common::transport::{Formats, FrameCodec, Transport, DEFAULT_MAX_FRAME_BYTES};
use skein_common::{Result, RpcError, RpcMessage, RpcRequest, RpcResponse, ServiceKey};
use skein_registry::ServiceDiscovery;
use tracing::{debug, warn};

use crate::pending::PendingRequests;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::ServiceProxy;

/// Client configuration.
///
/// # Default Configuration
///
/// - `load_balance`: `leastActive`
/// - `request_timeout`: 10 seconds
/// - `connect_timeout`: 5 seconds
/// - `heartbeat_interval`: 5 seconds
/// - `serializer` / `compressor`: `json` / `gzip`
/// - `max_frame_bytes`: 8 MiB
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `load-balancer` extension name
    pub load_balance: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// `serializer` extension name used for outgoing requests
    pub serializer: String,
    /// `compressor` extension name used for outgoing requests
    pub compressor: String,
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            load_balance: "leastActive".to_string(),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
            serializer: "json".to_string(),
            compressor: "gzip".to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ClientConfig {
    /// Reads the `rpc.client.*` and `rpc.codec.*` keys, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` for unparseable numbers.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            load_balance: config::read_string(source, keys::CLIENT_LOAD_BALANCE, &defaults.load_balance),
            request_timeout: config::read_millis(
                source,
                keys::CLIENT_REQUEST_TIMEOUT_MS,
                defaults.request_timeout,
            )?,
            connect_timeout: config::read_millis(
                source,
                keys::CLIENT_CONNECT_TIMEOUT_MS,
                defaults.connect_timeout,
            )?,
            heartbeat_interval: config::read_millis(
                source,
                keys::CLIENT_HEARTBEAT_INTERVAL_MS,
                defaults.heartbeat_interval,
            )?,
            serializer: config::read_string(source, keys::CLIENT_SERIALIZER, &defaults.serializer),
            compressor: config::read_string(source, keys::CLIENT_COMPRESSOR, &defaults.compressor),
            max_frame_bytes: config::read_usize(
                source,
                keys::CODEC_MAX_FRAME_BYTES,
                defaults.max_frame_bytes,
            )?,
        })
    }
}

struct ClientInner {
    discovery: Arc<dyn ServiceDiscovery>,
    balancer: Arc<dyn LoadBalancer>,
    recorder: Arc<ActiveRequestRecorder>,
    pending: Arc<PendingRequests>,
    pool: ConnectionPool,
    serializer: u8,
    compressor: u8,
    config: ClientConfig,
}

/// Sends requests to whichever provider discovery and the load balancer pick.
///
/// Calls to one provider share a single multiplexed connection. Cloning is
/// cheap and shares the pool.
///
/// # Example
///
/// ```no_run
/// # use std::sync::Arc;
/// # use skein_client::RpcClient;
/// # use skein_common::ServiceKey;
/// # async fn demo(client: RpcClient) -> skein_common::Result<()> {
/// let echo = client.proxy(ServiceKey::new("demo.Echo"));
/// let reply: String = echo.call("echo", ("hi".to_string(),)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Creates a client.
    ///
    /// `serializer` and `compressor` are the wire ids for outgoing requests;
    /// both must be present in `formats`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` if either id is not in `formats`.
    pub fn new(
        config: ClientConfig,
        discovery: Arc<dyn ServiceDiscovery>,
        transport: Arc<dyn Transport>,
        balancer: Arc<dyn LoadBalancer>,
        recorder: Arc<ActiveRequestRecorder>,
        formats: Arc<Formats>,
        serializer: u8,
        compressor: u8,
    ) -> Result<Self> {
        formats
            .serializer(serializer)
            .and(formats.compressor(compressor))
            .map_err(|e| RpcError::Config(e.to_string()))?;

        let pending = Arc::new(PendingRequests::new());
        let pool = ConnectionPool::new(
            transport,
            FrameCodec::new(formats, config.max_frame_bytes),
            pending.clone(),
            PoolConfig {
                connect_timeout: config.connect_timeout,
                heartbeat_interval: config.heartbeat_interval,
                serializer,
                compressor,
            },
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                discovery,
                balancer,
                recorder,
                pending,
                pool,
                serializer,
                compressor,
                config,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Binds `service` to a proxy.
    pub fn proxy(&self, service: ServiceKey) -> ServiceProxy {
        ServiceProxy::new(self.clone(), service)
    }

    /// Sends `request` to a provider of its service and waits for the response.
    ///
    /// A response is returned for every outcome the provider decides,
    /// including `404` and `500`; inspect [`RpcResponse::is_success`].
    ///
    /// # Errors
    ///
    /// - `NoAvailableAddress` if discovery found no provider, or found none
    ///   within the request timeout
    /// - `ConnectTimeout` / `Connection` if the provider cannot be reached
    /// - `RpcTimeout` if no response arrives within the request timeout
    /// - `ConnectionClosed` if the connection closes while waiting
    pub async fn send(&self, request: RpcRequest) -> Result<RpcResponse> {
        let inner = &self.inner;
        let service = request.service_key();
        let candidates = match tokio::time::timeout(
            inner.config.request_timeout,
            inner.discovery.resolve(&service),
        )
        .await
        {
            Ok(candidates) => candidates?,
            Err(_) => {
                warn!(service = %service, "Discovery did not answer within the request timeout");
                return Err(RpcError::NoAvailableAddress(format!(
                    "{} (discovery timed out)",
                    service
                )));
            }
        };
        let addr = inner.balancer.select(&service, &candidates)?;
        let connection = inner.pool.acquire(&addr).await?;
        let _active = inner.recorder.track(&service, &addr);

        let request_id = request.request_id.clone();
        let pending = inner.pending.register(request_id.clone(), connection.id());
        debug!(
            request_id = %request_id,
            service = %service,
            method = %request.method_name,
            addr = %addr,
            "Sending request"
        );

        let message = RpcMessage::request(request, inner.serializer, inner.compressor);
        if let Err(e) = connection.send(message).await {
            warn!(request_id = %request_id, addr = %addr, error = %e, "Failed to send request");
            connection.close();
            return Err(e);
        }

        match tokio::time::timeout(inner.config.request_timeout, pending).await {
            Ok(result) => result,
            Err(_) => {
                warn!(request_id = %request_id, addr = %addr, "Request timed out");
                Err(RpcError::RpcTimeout {
                    request_id,
                    timeout_ms: inner.config.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Calls that are waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    /// Providers with a pooled connection.
    pub fn connection_count(&self) -> usize {
        self.inner.pool.len()
    }

    /// Closes every pooled connection; in-flight calls fail.
    pub fn close(&self) {
        self.inner.pool.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.load_balance, "leastActive");
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.compressor, "gzip");
    }

    #[test]
    fn test_config_from_source() {
        let mut source = HashMap::new();
        source.insert(keys::CLIENT_LOAD_BALANCE.to_string(), "roundRobin".to_string());
        source.insert(keys::CLIENT_REQUEST_TIMEOUT_MS.to_string(), "1500".to_string());
        source.insert(keys::CLIENT_SERIALIZER.to_string(), "msgpack".to_string());

        let config = ClientConfig::from_source(&source).unwrap();
        assert_eq!(config.load_balance, "roundRobin");
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.serializer, "msgpack");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_rejects_bad_numbers() {
        let mut source = HashMap::new();
        source.insert(keys::CLIENT_CONNECT_TIMEOUT_MS.to_string(), "soon".to_string());
        assert!(matches!(ClientConfig::from_source(&source), Err(RpcError::Config(_))));
    }
}
