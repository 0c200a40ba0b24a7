use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use skein_common::config::{self, keys, ConfigSource};
use skein_common::{Result, RpcError, ServiceAddress, ServiceKey};
use tokio::sync::{broadcast, watch, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{ChildEvent, ChildWatch, Coordinator, CreateOutcome, SessionEvent};

/// Value stored in every provider entry.
pub const STATUS_OK: &[u8] = b"status:ok";

pub const DEFAULT_REGISTRY_ROOT: &str = "/skein-rpc";

/// Pause before re-checking the session after a failed provider fetch.
const SESSION_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Connect string of the coordination service, e.g. `zk1:2181,zk2:2181`
    /// for `zookeeper`. The `memory` coordinator only logs it.
    pub address: String,
    /// Namespace root under which service keys are published.
    pub root: String,
    /// How long startup waits for the first session, and how long a
    /// resolve waits for a lost session to come back.
    pub connect_timeout: Duration,
    /// `coordinator` extension name.
    pub coordinator: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: "memory".to_string(),
            root: DEFAULT_REGISTRY_ROOT.to_string(),
            connect_timeout: Duration::from_secs(30),
            coordinator: "memory".to_string(),
        }
    }
}

impl RegistryConfig {
    /// Reads the `rpc.registry.*` keys, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` for unparseable numbers or a root that
    /// does not start with `/`.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let defaults = Self::default();
        let root = config::read_string(source, keys::REGISTRY_ROOT, &defaults.root);
        if !root.starts_with('/') || root.len() < 2 {
            return Err(RpcError::Config(format!(
                "{} must be an absolute path, got '{}'",
                keys::REGISTRY_ROOT,
                root
            )));
        }
        Ok(Self {
            address: config::read_string(source, keys::REGISTRY_ADDRESS, &defaults.address),
            root: root.trim_end_matches('/').to_string(),
            connect_timeout: config::read_millis(
                source,
                keys::REGISTRY_CONNECT_TIMEOUT_MS,
                defaults.connect_timeout,
            )?,
            coordinator: config::read_string(source, keys::REGISTRY_COORDINATOR, &defaults.coordinator),
        })
    }
}

/// Connection state of the registry's coordination session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    SessionLost,
    Reconnected,
}

/// Resolves a service key to the addresses currently providing it.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn resolve(&self, service: &ServiceKey) -> Result<Vec<ServiceAddress>>;
}

/// Cached provider set for one service key, kept current by a child watch.
#[derive(Default)]
struct CachedService {
    addresses: RwLock<BTreeSet<ServiceAddress>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl CachedService {
    fn snapshot(&self) -> Vec<ServiceAddress> {
        self.addresses.read().iter().cloned().collect()
    }

    fn replace(&self, children: Vec<String>) {
        let addresses = children.iter().filter_map(|child| parse_child(child)).collect();
        *self.addresses.write() = addresses;
    }

    fn apply(&self, event: ChildEvent) {
        match event {
            ChildEvent::Added(child) => {
                if let Some(addr) = parse_child(&child) {
                    self.addresses.write().insert(addr);
                }
            }
            ChildEvent::Removed(child) => {
                if let Some(addr) = parse_child(&child) {
                    self.addresses.write().remove(&addr);
                }
            }
        }
    }
}

fn parse_child(child: &str) -> Option<ServiceAddress> {
    match child.parse() {
        Ok(addr) => Some(addr),
        Err(e) => {
            warn!(child, error = %e, "Ignoring registry entry that is not an address");
            None
        }
    }
}

struct RegistryInner {
    coordinator: Arc<dyn Coordinator>,
    config: RegistryConfig,
    state: watch::Sender<ConnectionState>,
    published: DashSet<String>,
    cache: DashMap<ServiceKey, Arc<OnceCell<Arc<CachedService>>>>,
    needs_replay: AtomicBool,
    shutdown: CancellationToken,
}

/// Publishes and discovers services through a [`Coordinator`].
///
/// Published paths are remembered so they can be re-created after a
/// session loss. Resolved service keys are cached and kept current by
/// child watches; after a reconnect every cached key is re-fetched and
/// re-watched.
///
/// Cloning shares the registry.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl ServiceRegistry {
    /// Establishes the coordination session and starts the session watcher.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::CoordinatorUnavailable` if no session is
    /// established within `config.connect_timeout`.
    pub async fn connect(coordinator: Arc<dyn Coordinator>, config: RegistryConfig) -> Result<Self> {
        let inner = Arc::new(RegistryInner {
            coordinator,
            config,
            state: watch::channel(ConnectionState::Disconnected).0,
            published: DashSet::new(),
            cache: DashMap::new(),
            needs_replay: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let events = inner.coordinator.session_events();
        inner.set_state(ConnectionState::Connecting);
        info!(
            address = %inner.config.address,
            root = %inner.config.root,
            "Connecting to coordination service"
        );

        if let Err(e) = inner
            .coordinator
            .wait_connected(inner.config.connect_timeout)
            .await
        {
            inner.set_state(ConnectionState::Disconnected);
            return Err(match e {
                RpcError::CoordinatorUnavailable(_) => e,
                other => RpcError::CoordinatorUnavailable(other.to_string()),
            });
        }
        inner.set_state(ConnectionState::Connected);

        SessionWatcher {
            inner: inner.clone(),
            events,
        }
        .spawn();

        Ok(ServiceRegistry { inner })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Registry path of one provider entry.
    pub fn provider_path(&self, service: &ServiceKey, addr: &ServiceAddress) -> String {
        format!("{}/{}", self.inner.service_path(service), addr)
    }

    /// Publishes `addr` as a provider of `service`.
    ///
    /// Publishing an existing entry is not an error. The path is remembered
    /// and re-created after a session loss; while the session is lost the
    /// publish is deferred to the reconnect instead of failing.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` for an invalid key, or the coordinator's
    /// error while the session is up.
    pub async fn publish(&self, service: &ServiceKey, addr: &ServiceAddress) -> Result<()> {
        service.validate()?;
        let path = self.provider_path(service, addr);
        self.inner.published.insert(path.clone());

        match self.inner.coordinator.create_ephemeral(&path, STATUS_OK).await {
            Ok(CreateOutcome::Created) => {
                info!(service = %service, addr = %addr, path = %path, "Service published");
                Ok(())
            }
            Ok(CreateOutcome::AlreadyExists) => {
                info!(path = %path, "Service entry already exists");
                Ok(())
            }
            Err(e) if self.state() == ConnectionState::SessionLost => {
                warn!(path = %path, error = %e, "Session lost, publish deferred until reconnect");
                Ok(())
            }
            Err(e) => {
                self.inner.published.remove(&path);
                Err(e)
            }
        }
    }

    /// Returns the providers of `service`.
    ///
    /// The first call for a key fetches the provider list and installs a
    /// child watch; concurrent first calls share that fetch. Later calls
    /// are served from the cache.
    ///
    /// If the first fetch fails because the session is gone, the call waits
    /// up to `connect_timeout` for the session to come back and retries.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NoAvailableAddress` if no session comes back in
    /// time. Coordinator errors never reach the caller.
    pub async fn resolve(&self, service: &ServiceKey) -> Result<Vec<ServiceAddress>> {
        let deadline = Instant::now() + self.inner.config.connect_timeout;
        loop {
            match self.fetch_cached(service).await {
                Ok(addresses) => return Ok(addresses),
                Err(e) => {
                    debug!(service = %service, error = %e, "Provider fetch failed, waiting for session");
                    if !self.inner.wait_for_session(deadline).await {
                        warn!(service = %service, error = %e, "No coordination session, cannot resolve providers");
                        return Err(RpcError::NoAvailableAddress(format!(
                            "{} (coordination session unavailable)",
                            service
                        )));
                    }
                }
            }
        }
    }

    async fn fetch_cached(&self, service: &ServiceKey) -> Result<Vec<ServiceAddress>> {
        let cell = self.inner.cache.entry(service.clone()).or_default().clone();
        let inner = &self.inner;
        let cached = cell
            .get_or_try_init(|| async {
                let cached = Arc::new(CachedService::default());
                inner.refresh(service, &cached).await?;
                Ok::<_, RpcError>(cached)
            })
            .await?;
        Ok(cached.snapshot())
    }

    /// Cached providers of `service`, without fetching.
    pub fn cached(&self, service: &ServiceKey) -> Option<Vec<ServiceAddress>> {
        self.inner
            .cache
            .get(service)
            .and_then(|cell| cell.get().map(|cached| cached.snapshot()))
    }

    /// Deletes every remembered entry published for `addr`.
    ///
    /// Failures are logged and skipped.
    pub async fn unpublish_all(&self, addr: &ServiceAddress) {
        let suffix = format!("/{}", addr);
        let paths: Vec<String> = self
            .inner
            .published
            .iter()
            .filter(|path| path.ends_with(&suffix))
            .map(|path| path.clone())
            .collect();

        for path in paths {
            self.inner.published.remove(&path);
            match self.inner.coordinator.delete(&path).await {
                Ok(true) => info!(path = %path, "Service entry removed"),
                Ok(false) => debug!(path = %path, "Service entry already gone"),
                Err(e) => warn!(path = %path, error = %e, "Failed to remove service entry"),
            }
        }
    }

    /// Remembered provider paths, sorted.
    pub fn published_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.inner.published.iter().map(|p| p.clone()).collect();
        paths.sort();
        paths
    }

    /// Stops the session watcher and all child watches.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        for entry in self.inner.cache.iter() {
            if let Some(cached) = entry.value().get() {
                if let Some(handle) = cached.watcher.lock().take() {
                    handle.abort();
                }
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }
}

#[async_trait]
impl ServiceDiscovery for ServiceRegistry {
    async fn resolve(&self, service: &ServiceKey) -> Result<Vec<ServiceAddress>> {
        ServiceRegistry::resolve(self, service).await
    }
}

impl RegistryInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Registry connection state changed");
        }
    }

    /// Waits until the session is usable again. Returns `false` at the
    /// deadline or on close.
    async fn wait_for_session(&self, deadline: Instant) -> bool {
        let mut state = self.state.subscribe();
        let usable = async {
            tokio::time::sleep(SESSION_RETRY_INTERVAL).await;
            state
                .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Reconnected))
                .await
                .is_ok()
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            usable = tokio::time::timeout_at(deadline, usable) => usable.unwrap_or(false),
        }
    }

    fn service_path(&self, service: &ServiceKey) -> String {
        format!("{}/{}", self.config.root, service)
    }

    /// Re-fetches the providers of `service` and (re)installs its watch.
    async fn refresh(&self, service: &ServiceKey, cached: &Arc<CachedService>) -> Result<()> {
        let path = self.service_path(service);
        let watch = self.coordinator.watch_children(&path).await?;
        let children = self.coordinator.children(&path).await?;
        debug!(service = %service, providers = children.len(), "Fetched service providers");

        // events received after the fetch are applied on top of it
        cached.replace(children);
        let handle = spawn_child_watcher(service.clone(), cached.clone(), watch, self.shutdown.clone());
        if let Some(previous) = cached.watcher.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn replay_published(&self) {
        let paths: Vec<String> = self.published.iter().map(|p| p.clone()).collect();
        for path in paths {
            match self.coordinator.create_ephemeral(&path, STATUS_OK).await {
                Ok(CreateOutcome::Created) => info!(path = %path, "Service entry re-created"),
                Ok(CreateOutcome::AlreadyExists) => debug!(path = %path, "Service entry already exists"),
                Err(e) => warn!(path = %path, error = %e, "Failed to re-create service entry"),
            }
        }
    }

    async fn reconcile_cache(&self) {
        let cached: Vec<(ServiceKey, Arc<CachedService>)> = self
            .cache
            .iter()
            .filter_map(|entry| entry.value().get().map(|c| (entry.key().clone(), c.clone())))
            .collect();
        for (service, cached) in cached {
            if let Err(e) = self.refresh(&service, &cached).await {
                warn!(service = %service, error = %e, "Failed to refresh service providers");
            }
        }
    }
}

fn spawn_child_watcher(
    service: ServiceKey,
    cached: Arc<CachedService>,
    mut watch: ChildWatch,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = watch.recv() => match event {
                    Some(event) => {
                        debug!(service = %service, event = ?event, "Provider change");
                        cached.apply(event);
                    }
                    None => {
                        debug!(service = %service, "Child watch ended");
                        break;
                    }
                },
            }
        }
    })
}

/// Follows session lifecycle events and runs the reconnection flow.
struct SessionWatcher {
    inner: Arc<RegistryInner>,
    events: broadcast::Receiver<SessionEvent>,
}

impl SessionWatcher {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                event = self.events.recv() => event,
            };
            match event {
                Ok(SessionEvent::Connected) => self.inner.set_state(ConnectionState::Connected),
                Ok(SessionEvent::Lost) => {
                    warn!("Coordination session lost, will re-register on reconnect");
                    self.inner.set_state(ConnectionState::SessionLost);
                    self.inner.needs_replay.store(true, Ordering::SeqCst);
                }
                Ok(SessionEvent::Reconnected) => {
                    self.inner.set_state(ConnectionState::Reconnected);
                    self.replay_once().await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // a dropped Lost must not skip the replay
                    warn!(missed, "Missed session events, replaying registrations when connected");
                    self.inner.needs_replay.store(true, Ordering::SeqCst);
                    if self.inner.coordinator.exists(&self.inner.config.root).await.is_ok() {
                        self.inner.set_state(ConnectionState::Reconnected);
                        self.replay_once().await;
                    } else {
                        self.inner.set_state(ConnectionState::SessionLost);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Session watcher stopped");
    }

    async fn replay_once(&self) {
        if self
            .inner
            .needs_replay
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Coordination session re-established, replaying registrations");
            self.inner.replay_published().await;
            self.inner.reconcile_cache().await;
        }
    }
}
