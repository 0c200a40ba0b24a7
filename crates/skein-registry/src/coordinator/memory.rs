//! In-process coordination service.
//!
//! A [`MemoryEnsemble`] holds one hierarchical namespace shared by any
//! number of [`MemoryCoordinator`] sessions, the same way several processes
//! share one coordination cluster. Sessions own their ephemeral nodes and
//! watches; expiring a session removes both and notifies the remaining
//! watchers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use skein_common::{Result, RpcError};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use super::{ChildEvent, ChildWatch, Coordinator, CreateOutcome, SessionEvent};

type SessionId = u64;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    owner: Option<SessionId>,
}

struct Watcher {
    session: SessionId,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

#[derive(Default)]
struct Namespace {
    nodes: BTreeMap<String, Node>,
    watchers: HashMap<String, Vec<Watcher>>,
    sessions: HashSet<SessionId>,
    next_session: SessionId,
}

/// Splits `/a/b/c` into (`/a/b`, `c`).
fn split_path(path: &str) -> Result<(&str, &str)> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(RpcError::Coordination(format!("invalid path '{}'", path)));
    }
    match path.rsplit_once('/') {
        Some(("", name)) => Ok(("/", name)),
        Some((parent, name)) => Ok((parent, name)),
        None => Err(RpcError::Coordination(format!("invalid path '{}'", path))),
    }
}

impl Namespace {
    fn open_session(&mut self) -> SessionId {
        self.next_session += 1;
        let id = self.next_session;
        self.sessions.insert(id);
        id
    }

    fn notify(&mut self, parent: &str, event: ChildEvent) {
        if let Some(watchers) = self.watchers.get_mut(parent) {
            watchers.retain(|w| w.tx.send(event.clone()).is_ok());
        }
    }

    fn ensure_parents(&mut self, parent: &str) -> Result<()> {
        if parent == "/" || self.nodes.contains_key(parent) {
            return Ok(());
        }
        let (grandparent, name) = split_path(parent)?;
        self.ensure_parents(grandparent)?;
        self.nodes.insert(
            parent.to_string(),
            Node {
                data: Vec::new(),
                owner: None,
            },
        );
        self.notify(grandparent, ChildEvent::Added(name.to_string()));
        Ok(())
    }

    fn create(&mut self, path: &str, data: &[u8], owner: SessionId) -> Result<CreateOutcome> {
        let (parent, name) = split_path(path)?;
        if self.nodes.contains_key(path) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        self.ensure_parents(parent)?;
        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_vec(),
                owner: Some(owner),
            },
        );
        self.notify(parent, ChildEvent::Added(name.to_string()));
        Ok(CreateOutcome::Created)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn delete(&mut self, path: &str) -> Result<bool> {
        let (parent, name) = split_path(path)?;
        if !self.nodes.contains_key(path) {
            return Ok(false);
        }
        if !self.children(path).is_empty() {
            return Err(RpcError::Coordination(format!("node '{}' has children", path)));
        }
        self.nodes.remove(path);
        self.notify(parent, ChildEvent::Removed(name.to_string()));
        Ok(true)
    }

    fn expire(&mut self, session: SessionId) -> usize {
        self.sessions.remove(&session);
        for watchers in self.watchers.values_mut() {
            watchers.retain(|w| w.session != session);
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &owned {
            if let Ok((parent, name)) = split_path(path) {
                self.nodes.remove(path);
                self.notify(parent, ChildEvent::Removed(name.to_string()));
            }
        }
        owned.len()
    }
}

/// A shared in-process coordination namespace.
///
/// Cloning shares the namespace. The ensemble can be switched unavailable to
/// simulate an outage: new sessions cannot be opened and operations fail.
#[derive(Clone)]
pub struct MemoryEnsemble {
    namespace: Arc<Mutex<Namespace>>,
    available: Arc<watch::Sender<bool>>,
    children_reads: Arc<AtomicU64>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        let (available, _) = watch::channel(true);
        MemoryEnsemble {
            namespace: Arc::new(Mutex::new(Namespace::default())),
            available: Arc::new(available),
            children_reads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Creates a session handle. The session opens on `wait_connected`.
    pub fn session(&self) -> MemoryCoordinator {
        let (events, _) = broadcast::channel(16);
        MemoryCoordinator {
            ensemble: self.clone(),
            session: Mutex::new(None),
            events,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.send_replace(available);
        info!(available, "Memory ensemble availability changed");
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Total number of `children` reads served, across all sessions.
    pub fn children_reads(&self) -> u64 {
        self.children_reads.load(Ordering::SeqCst)
    }

    /// Children of `path` as seen by an observer outside any session.
    pub fn peek_children(&self, path: &str) -> Vec<String> {
        self.namespace.lock().children(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.namespace.lock().nodes.contains_key(path)
    }

    /// Data stored at `path`, if the node exists.
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.namespace.lock().nodes.get(path).map(|node| node.data.clone())
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session on a [`MemoryEnsemble`].
pub struct MemoryCoordinator {
    ensemble: MemoryEnsemble,
    session: Mutex<Option<SessionId>>,
    events: broadcast::Sender<SessionEvent>,
}

impl MemoryCoordinator {
    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }

    pub fn is_connected(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Ends the current session as if it had timed out on the server side.
    ///
    /// Ephemeral nodes and watches of the session are removed and `Lost`
    /// is broadcast.
    pub fn expire_session(&self) {
        let Some(id) = self.session.lock().take() else {
            return;
        };
        let removed = self.ensemble.namespace.lock().expire(id);
        warn!(session = id, removed, "Coordination session expired");
        let _ = self.events.send(SessionEvent::Lost);
    }

    /// Opens a new session after [`expire_session`](Self::expire_session)
    /// and broadcasts `Reconnected`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::CoordinatorUnavailable` while the ensemble is down.
    pub fn reconnect(&self) -> Result<()> {
        if !self.ensemble.is_available() {
            return Err(RpcError::CoordinatorUnavailable(
                "memory ensemble is unavailable".to_string(),
            ));
        }
        let id = {
            let mut session = self.session.lock();
            if session.is_some() {
                return Ok(());
            }
            let id = self.ensemble.namespace.lock().open_session();
            *session = Some(id);
            id
        };
        info!(session = id, "Coordination session re-established");
        let _ = self.events.send(SessionEvent::Reconnected);
        Ok(())
    }

    fn current_session(&self) -> Result<SessionId> {
        if !self.ensemble.is_available() {
            return Err(RpcError::Coordination("memory ensemble is unavailable".to_string()));
        }
        self.session
            .lock()
            .ok_or_else(|| RpcError::Coordination("no coordination session".to_string()))
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let mut available = self.ensemble.available.subscribe();
        let became_available = tokio::time::timeout(timeout, available.wait_for(|up| *up))
            .await
            .map(|ready| ready.is_ok())
            .unwrap_or(false);
        if !became_available {
            return Err(RpcError::CoordinatorUnavailable(format!(
                "no session established within {}ms",
                timeout.as_millis()
            )));
        }

        let id = {
            let mut session = self.session.lock();
            if session.is_some() {
                return Ok(());
            }
            let id = self.ensemble.namespace.lock().open_session();
            *session = Some(id);
            id
        };
        info!(session = id, "Coordination session established");
        let _ = self.events.send(SessionEvent::Connected);
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<CreateOutcome> {
        let session = self.current_session()?;
        self.ensemble.namespace.lock().create(path, data, session)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.current_session()?;
        Ok(self.ensemble.contains(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.current_session()?;
        self.ensemble.children_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.ensemble.peek_children(path))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        self.current_session()?;
        self.ensemble.namespace.lock().delete(path)
    }

    async fn watch_children(&self, path: &str) -> Result<ChildWatch> {
        let session = self.current_session()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.ensemble
            .namespace
            .lock()
            .watchers
            .entry(path.to_string())
            .or_default()
            .push(Watcher { session, tx });
        debug!(path, session, "Child watch installed");
        Ok(rx)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(ensemble: &MemoryEnsemble) -> MemoryCoordinator {
        let session = ensemble.session();
        session.wait_connected(Duration::from_secs(1)).await.unwrap();
        session
    }

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a").unwrap(), ("/", "a"));
        assert_eq!(split_path("/a/b/c").unwrap(), ("/a/b", "c"));
        assert!(split_path("a/b").is_err());
        assert!(split_path("/a/").is_err());
        assert!(split_path("/").is_err());
        assert!(split_path("/a//b").is_err());
    }

    #[tokio::test]
    async fn test_create_builds_parents_and_is_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let session = connected(&ensemble).await;

        let outcome = session.create_ephemeral("/root/svc/host:1", b"status:ok").await.unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
        assert!(session.exists("/root").await.unwrap());
        assert!(session.exists("/root/svc").await.unwrap());
        assert_eq!(ensemble.data("/root/svc/host:1"), Some(b"status:ok".to_vec()));

        let again = session.create_ephemeral("/root/svc/host:1", b"status:ok").await.unwrap();
        assert_eq!(again, CreateOutcome::AlreadyExists);
        assert_eq!(session.children("/root/svc").await.unwrap(), vec!["host:1".to_string()]);
    }

    #[tokio::test]
    async fn test_children_of_missing_path_is_empty() {
        let ensemble = MemoryEnsemble::new();
        let session = connected(&ensemble).await;
        assert!(session.children("/nothing/here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_children_excludes_grandchildren() {
        let ensemble = MemoryEnsemble::new();
        let session = connected(&ensemble).await;
        session.create_ephemeral("/r/a/x", b"").await.unwrap();
        session.create_ephemeral("/r/b", b"").await.unwrap();
        session.create_ephemeral("/rr", b"").await.unwrap();

        assert_eq!(session.children("/r").await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_receives_added_and_removed() {
        let ensemble = MemoryEnsemble::new();
        let watcher = connected(&ensemble).await;
        let provider = connected(&ensemble).await;

        let mut events = watcher.watch_children("/r/svc").await.unwrap();
        provider.create_ephemeral("/r/svc/a:1", b"").await.unwrap();
        assert_eq!(events.recv().await, Some(ChildEvent::Added("a:1".to_string())));

        assert!(provider.delete("/r/svc/a:1").await.unwrap());
        assert_eq!(events.recv().await, Some(ChildEvent::Removed("a:1".to_string())));
        assert!(!provider.delete("/r/svc/a:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_removes_ephemerals_and_watches() {
        let ensemble = MemoryEnsemble::new();
        let observer = connected(&ensemble).await;
        let provider = connected(&ensemble).await;
        let mut lifecycle = provider.session_events();

        let mut observed = observer.watch_children("/r/svc").await.unwrap();
        let mut own_watch = provider.watch_children("/r/svc").await.unwrap();
        provider.create_ephemeral("/r/svc/a:1", b"").await.unwrap();
        assert_eq!(observed.recv().await, Some(ChildEvent::Added("a:1".to_string())));
        assert_eq!(own_watch.recv().await, Some(ChildEvent::Added("a:1".to_string())));

        provider.expire_session();
        assert_eq!(lifecycle.recv().await.unwrap(), SessionEvent::Lost);
        assert_eq!(observed.recv().await, Some(ChildEvent::Removed("a:1".to_string())));
        assert_eq!(own_watch.recv().await, None);
        assert!(!ensemble.contains("/r/svc/a:1"));
        assert!(ensemble.contains("/r/svc"));

        assert!(provider.create_ephemeral("/r/svc/a:1", b"").await.is_err());
        provider.reconnect().unwrap();
        assert_eq!(lifecycle.recv().await.unwrap(), SessionEvent::Reconnected);
        assert!(provider.create_ephemeral("/r/svc/a:1", b"").await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_connected_times_out_when_unavailable() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);
        let session = ensemble.session();

        let result = session.wait_connected(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(RpcError::CoordinatorUnavailable(_))));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_wait_connected_succeeds_once_available() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);
        let session = ensemble.session();

        let toggler = ensemble.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            toggler.set_available(true);
        });

        session.wait_connected(Duration::from_secs(2)).await.unwrap();
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_delete_refuses_non_empty() {
        let ensemble = MemoryEnsemble::new();
        let session = connected(&ensemble).await;
        session.create_ephemeral("/r/svc/a:1", b"").await.unwrap();
        assert!(session.delete("/r/svc").await.is_err());
    }
}
