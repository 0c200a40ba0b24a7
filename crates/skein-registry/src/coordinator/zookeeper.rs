//! Coordinator backed by an Apache ZooKeeper ensemble.
//!
//! Provider entries are ephemeral znodes, so ZooKeeper removes them when the
//! owning session expires. An expired session cannot be resumed: the
//! coordinator reports `Lost`, opens a fresh client and reports
//! `Reconnected`, after which the registry replays its entries.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use skein_common::{Result, RpcError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

use super::{ChildEvent, ChildWatch, Coordinator, CreateOutcome, SessionEvent};

/// Pause between attempts to replace an expired session.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

struct Shared {
    address: String,
    client: RwLock<Option<zk::Client>>,
    events: broadcast::Sender<SessionEvent>,
}

/// One ZooKeeper session, addressed by a connect string such as
/// `zk1:2181,zk2:2181`.
///
/// The session opens on [`wait_connected`](Coordinator::wait_connected). A
/// background task follows its state and replaces it after expiry.
pub struct ZooKeeperCoordinator {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ZooKeeperCoordinator {
    pub fn new(address: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(16);
        ZooKeeperCoordinator {
            shared: Arc::new(Shared {
                address: address.into(),
                client: RwLock::new(None),
                events,
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn is_connected(&self) -> bool {
        self.shared.client.read().is_some()
    }

    fn client(&self) -> Result<zk::Client> {
        self.shared
            .client
            .read()
            .clone()
            .ok_or_else(|| RpcError::Coordination("no coordination session".to_string()))
    }
}

impl Drop for ZooKeeperCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

fn coordination(path: &str, error: zk::Error) -> RpcError {
    RpcError::Coordination(format!("{}: {}", path, error))
}

/// Every proper ancestor of `path`, outermost first.
fn parent_paths(path: &str) -> Vec<String> {
    let mut parents = Vec::new();
    let mut prefix = String::new();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for segment in segments.iter().take(segments.len().saturating_sub(1)) {
        prefix.push('/');
        prefix.push_str(segment);
        parents.push(prefix.clone());
    }
    parents
}

/// Events turning `known` into `current`.
fn child_changes(known: &BTreeSet<String>, current: &BTreeSet<String>) -> Vec<ChildEvent> {
    let added = current.difference(known).cloned().map(ChildEvent::Added);
    let removed = known.difference(current).cloned().map(ChildEvent::Removed);
    added.chain(removed).collect()
}

async fn list_children(client: &zk::Client, path: &str) -> Result<BTreeSet<String>> {
    match client.list_children(path).await {
        Ok(children) => Ok(children.into_iter().collect()),
        Err(zk::Error::NoNode) => Ok(BTreeSet::new()),
        Err(e) => Err(coordination(path, e)),
    }
}

fn session_ended(state: &zk::SessionState) -> bool {
    matches!(
        state,
        zk::SessionState::Expired | zk::SessionState::AuthFailed | zk::SessionState::Closed
    )
}

/// Follows the session state and replaces the client after expiry.
async fn supervise(shared: Arc<Shared>, client: zk::Client) {
    let mut client = client;
    loop {
        let mut states = client.state_watcher();
        let state = loop {
            let state = states.changed().await;
            debug!(address = %shared.address, state = ?state, "ZooKeeper session state");
            if session_ended(&state) {
                break state;
            }
        };

        warn!(address = %shared.address, state = ?state, "ZooKeeper session ended");
        *shared.client.write() = None;
        let _ = shared.events.send(SessionEvent::Lost);

        client = loop {
            tokio::time::sleep(RECONNECT_INTERVAL).await;
            match zk::Client::connect(&shared.address).await {
                Ok(client) => break client,
                Err(e) => warn!(address = %shared.address, error = %e, "ZooKeeper reconnect failed"),
            }
        };
        *shared.client.write() = Some(client.clone());
        info!(address = %shared.address, "ZooKeeper session re-established");
        let _ = shared.events.send(SessionEvent::Reconnected);
    }
}

#[async_trait]
impl Coordinator for ZooKeeperCoordinator {
    async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let client = match tokio::time::timeout(timeout, zk::Client::connect(&self.shared.address)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(RpcError::CoordinatorUnavailable(format!(
                    "{}: {}",
                    self.shared.address, e
                )));
            }
            Err(_) => {
                return Err(RpcError::CoordinatorUnavailable(format!(
                    "no session with {} within {}ms",
                    self.shared.address,
                    timeout.as_millis()
                )));
            }
        };

        *self.shared.client.write() = Some(client.clone());
        let handle = tokio::spawn(supervise(self.shared.clone(), client));
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }
        info!(address = %self.shared.address, "ZooKeeper session established");
        let _ = self.shared.events.send(SessionEvent::Connected);
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<CreateOutcome> {
        let client = self.client()?;
        let persistent = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        for parent in parent_paths(path) {
            match client.create(&parent, &[], &persistent).await {
                Ok(_) | Err(zk::Error::NodeExists) => {}
                Err(e) => return Err(coordination(&parent, e)),
            }
        }

        let ephemeral = zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all());
        match client.create(path, data, &ephemeral).await {
            Ok(_) => Ok(CreateOutcome::Created),
            Err(zk::Error::NodeExists) => Ok(CreateOutcome::AlreadyExists),
            Err(e) => Err(coordination(path, e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let client = self.client()?;
        client
            .check_stat(path)
            .await
            .map(|stat| stat.is_some())
            .map_err(|e| coordination(path, e))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let client = self.client()?;
        Ok(list_children(&client, path).await?.into_iter().collect())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let client = self.client()?;
        match client.delete(path, None).await {
            Ok(()) => Ok(true),
            Err(zk::Error::NoNode) => Ok(false),
            Err(e) => Err(coordination(path, e)),
        }
    }

    /// Installs a persistent watch and reports children as the difference
    /// between consecutive listings.
    async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
        let client = self.client()?;
        let mut watcher = client
            .watch(path, zk::AddWatchMode::Persistent)
            .await
            .map_err(|e| coordination(path, e))?;
        let mut known = list_children(&client, path).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let path = path.to_string();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = tx.closed() => break,
                    event = watcher.changed() => event,
                };
                match event.event_type {
                    zk::EventType::Session => {
                        if session_ended(&event.session_state) {
                            break;
                        }
                    }
                    zk::EventType::NodeChildrenChanged
                    | zk::EventType::NodeCreated
                    | zk::EventType::NodeDeleted => {
                        let current = match list_children(&client, &path).await {
                            Ok(current) => current,
                            Err(e) => {
                                warn!(path = %path, error = %e, "Failed to list children after change");
                                continue;
                            }
                        };
                        for change in child_changes(&known, &current) {
                            if tx.send(change).is_err() {
                                return;
                            }
                        }
                        known = current;
                    }
                    _ => {}
                }
            }
            debug!(path = %path, "ZooKeeper child watch ended");
        });
        Ok(rx)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_parent_paths() {
        assert_eq!(
            parent_paths("/skein-rpc/demo.Echo##/127.0.0.1:9998"),
            vec!["/skein-rpc".to_string(), "/skein-rpc/demo.Echo##".to_string()]
        );
        assert!(parent_paths("/top").is_empty());
    }

    #[test]
    fn test_child_changes() {
        let changes = child_changes(&set(&["a:1", "b:2"]), &set(&["b:2", "c:3"]));
        assert_eq!(
            changes,
            vec![ChildEvent::Added("c:3".to_string()), ChildEvent::Removed("a:1".to_string())]
        );
        assert!(child_changes(&set(&["a:1"]), &set(&["a:1"])).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_ensemble_is_unavailable() {
        let coordinator = ZooKeeperCoordinator::new("127.0.0.1:1");
        let result = coordinator.wait_connected(Duration::from_millis(300)).await;
        assert!(matches!(result, Err(RpcError::CoordinatorUnavailable(_))));
        assert!(matches!(coordinator.children("/x").await, Err(RpcError::Coordination(_))));
    }
}
