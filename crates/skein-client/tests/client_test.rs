//! Client engine tests against a scripted provider speaking the frame codec.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use skein_balance::{ActiveRequestRecorder, RoundRobinBalancer};
use skein_client::{ClientConfig, RpcClient};
use skein_common::transport::{Formats, FrameCodec, TcpTransport, GZIP_COMPRESSOR_ID, JSON_SERIALIZER_ID};
use skein_common::{
    MessageBody, MessageType, Result, RpcError, RpcMessage, RpcResponse, ServiceAddress, ServiceKey,
};
use skein_registry::ServiceDiscovery;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

struct StaticDiscovery(Vec<ServiceAddress>);

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn resolve(&self, _service: &ServiceKey) -> Result<Vec<ServiceAddress>> {
        Ok(self.0.clone())
    }
}

/// Discovery that never answers.
struct StalledDiscovery;

#[async_trait]
impl ServiceDiscovery for StalledDiscovery {
    async fn resolve(&self, _service: &ServiceKey) -> Result<Vec<ServiceAddress>> {
        std::future::pending().await
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    /// Answers with the first parameter.
    Echo,
    /// Reads requests and never answers.
    Silent,
    /// Drops the connection when a request arrives.
    Hangup,
}

struct FakeProvider {
    addr: ServiceAddress,
    accepted: Arc<AtomicUsize>,
    frames: mpsc::UnboundedReceiver<MessageType>,
}

async fn fake_provider(behavior: Behavior) -> FakeProvider {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ServiceAddress::from(listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    let (seen, frames) = mpsc::unbounded_channel();

    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, FrameCodec::default());
                while let Some(Ok(message)) = framed.next().await {
                    let _ = seen.send(message.message_type);
                    let MessageBody::Request(request) = message.body else {
                        continue;
                    };
                    match behavior {
                        Behavior::Echo => {
                            let value = request.parameters.first().cloned().unwrap_or(json!(null));
                            let response = RpcResponse::success(request.request_id, value);
                            framed
                                .send(RpcMessage::response(response, message.serializer, message.compressor))
                                .await
                                .unwrap();
                        }
                        Behavior::Silent => {}
                        Behavior::Hangup => return,
                    }
                }
            });
        }
    });

    FakeProvider {
        addr,
        accepted,
        frames,
    }
}

fn client(addrs: Vec<ServiceAddress>, config: ClientConfig) -> RpcClient {
    RpcClient::new(
        config,
        Arc::new(StaticDiscovery(addrs)),
        Arc::new(TcpTransport),
        Arc::new(RoundRobinBalancer::new()),
        Arc::new(ActiveRequestRecorder::new()),
        Arc::new(Formats::builtin()),
        JSON_SERIALIZER_ID,
        GZIP_COMPRESSOR_ID,
    )
    .unwrap()
}

fn echo_key() -> ServiceKey {
    ServiceKey::new("demo.Echo")
}

#[tokio::test]
async fn test_call_round_trip() {
    let provider = fake_provider(Behavior::Echo).await;
    let client = client(vec![provider.addr.clone()], ClientConfig::default());

    let reply: String = client.proxy(echo_key()).call("echo", ("hello".to_string(),)).await.unwrap();
    assert_eq!(reply, "hello");
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let provider = fake_provider(Behavior::Echo).await;
    let client = client(vec![provider.addr.clone()], ClientConfig::default());
    let proxy = client.proxy(echo_key());

    let calls: Vec<_> = (0..32i64)
        .map(|i| {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.call::<_, i64>("echo", (i,)).await.unwrap() })
        })
        .collect();
    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.await.unwrap(), i as i64);
    }

    assert_eq!(provider.accepted.load(Ordering::SeqCst), 1);
    assert_eq!(client.connection_count(), 1);
}

#[tokio::test]
async fn test_request_timeout_cleans_pending() {
    let provider = fake_provider(Behavior::Silent).await;
    let config = ClientConfig {
        request_timeout: Duration::from_millis(100),
        ..ClientConfig::default()
    };
    let client = client(vec![provider.addr.clone()], config);

    let result = client.proxy(echo_key()).call::<_, String>("echo", ("x".to_string(),)).await;
    assert!(matches!(result, Err(RpcError::RpcTimeout { timeout_ms: 100, .. })));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_peer_close_fails_in_flight_calls() {
    let provider = fake_provider(Behavior::Hangup).await;
    let client = client(vec![provider.addr.clone()], ClientConfig::default());

    let result = client.proxy(echo_key()).call::<_, String>("echo", ("x".to_string(),)).await;
    assert!(matches!(result, Err(RpcError::ConnectionClosed(_))));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_closed_connection_is_replaced() {
    let provider = fake_provider(Behavior::Echo).await;
    let client = client(vec![provider.addr.clone()], ClientConfig::default());
    let proxy = client.proxy(echo_key());

    let _: i64 = proxy.call("echo", (1i64,)).await.unwrap();
    client.close();
    let reply: i64 = proxy.call("echo", (2i64,)).await.unwrap();

    assert_eq!(reply, 2);
    assert_eq!(provider.accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_idle_connection_sends_heartbeat() {
    let mut provider = fake_provider(Behavior::Echo).await;
    let config = ClientConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..ClientConfig::default()
    };
    let client = client(vec![provider.addr.clone()], config);

    let _: i64 = client.proxy(echo_key()).call("echo", (1i64,)).await.unwrap();
    assert_eq!(provider.frames.recv().await, Some(MessageType::Request));

    let next = tokio::time::timeout(Duration::from_secs(2), provider.frames.recv())
        .await
        .unwrap();
    assert_eq!(next, Some(MessageType::HeartbeatPing));
}

#[tokio::test]
async fn test_no_providers() {
    let client = client(vec![], ClientConfig::default());
    let result = client.proxy(echo_key()).call::<_, String>("echo", ()).await;
    assert!(matches!(result, Err(RpcError::NoAvailableAddress(_))));
}

#[tokio::test]
async fn test_unreachable_provider() {
    // bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ServiceAddress::from(listener.local_addr().unwrap());
    drop(listener);

    let client = client(vec![addr], ClientConfig::default());
    let result = client.proxy(echo_key()).call::<_, String>("echo", ()).await;
    assert!(matches!(
        result,
        Err(RpcError::Connection(_)) | Err(RpcError::ConnectTimeout { .. })
    ));
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_unknown_format_rejected_at_construction() {
    let result = RpcClient::new(
        ClientConfig::default(),
        Arc::new(StaticDiscovery(vec![])),
        Arc::new(TcpTransport),
        Arc::new(RoundRobinBalancer::new()),
        Arc::new(ActiveRequestRecorder::new()),
        Arc::new(Formats::builtin()),
        0x7F,
        GZIP_COMPRESSOR_ID,
    );
    assert!(matches!(result, Err(RpcError::Config(_))));
}

#[tokio::test]
async fn test_stalled_discovery_is_no_available_address() {
    let config = ClientConfig {
        request_timeout: Duration::from_millis(100),
        ..ClientConfig::default()
    };
    let client = RpcClient::new(
        config,
        Arc::new(StalledDiscovery),
        Arc::new(TcpTransport),
        Arc::new(RoundRobinBalancer::new()),
        Arc::new(ActiveRequestRecorder::new()),
        Arc::new(Formats::builtin()),
        JSON_SERIALIZER_ID,
        GZIP_COMPRESSOR_ID,
    )
    .unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        client.proxy(echo_key()).invoke("ping", vec![], vec![]),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(RpcError::NoAvailableAddress(_))));
    assert_eq!(client.in_flight(), 0);
}
