//! The seam between the registry and the coordination service.
//!
//! A coordination service exposes a hierarchical namespace with ephemeral
//! nodes (removed when their owning session ends), child watches, and
//! session lifecycle notifications. [`Coordinator`] is everything the
//! registry needs from one. [`memory`] provides an in-process implementation;
//! with the `zookeeper` feature, `zookeeper` talks to an Apache ZooKeeper
//! ensemble.

pub mod memory;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skein_common::extension::{Extension, ExtensionLoader};
use skein_common::Result;
use tokio::sync::{broadcast, mpsc};

use self::memory::MemoryEnsemble;

/// Result of creating an ephemeral node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// A change to the children of a watched node. Carries the child's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Added(String),
    Removed(String),
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// First session established.
    Connected,
    /// Session expired; ephemeral nodes and watches of the session are gone.
    Lost,
    /// A new session replaced a lost one.
    Reconnected,
}

/// Stream of child events for one watched path.
///
/// The stream ends when the session that installed the watch is lost.
pub type ChildWatch = mpsc::UnboundedReceiver<ChildEvent>;

/// Client session to a coordination service.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Waits until a session is established.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::CoordinatorUnavailable` if no session is
    /// established within `timeout`.
    async fn wait_connected(&self, timeout: Duration) -> Result<()>;

    /// Creates an ephemeral node owned by this session, creating missing
    /// parents as persistent nodes.
    async fn create_ephemeral(&self, path: &str, data: &[u8]) -> Result<CreateOutcome>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names of the direct children of `path`; empty if `path` does not exist.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Deletes a node. Returns `false` if it did not exist.
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Installs a persistent watch on the children of `path`.
    async fn watch_children(&self, path: &str) -> Result<ChildWatch>;

    /// Subscribes to session lifecycle notifications.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}

impl Extension for dyn Coordinator {
    const CAPABILITY: &'static str = "coordinator";
    const DEFAULT_CONFIG: &'static str = "\
memory=skein_registry::MemoryCoordinator
zookeeper=skein_registry::ZooKeeperCoordinator
";
}

/// Registers the built-in coordinators.
///
/// `memory` opens sessions on `ensemble`. `zookeeper`, registered only with
/// the `zookeeper` feature, connects to `address`.
pub fn register_builtin_coordinators(
    loader: &ExtensionLoader<dyn Coordinator>,
    ensemble: MemoryEnsemble,
    address: &str,
) {
    loader.register("skein_registry::MemoryCoordinator", move || Arc::new(ensemble.session()));
    #[cfg(feature = "zookeeper")]
    {
        let address = address.to_string();
        loader.register("skein_registry::ZooKeeperCoordinator", move || {
            Arc::new(zookeeper::ZooKeeperCoordinator::new(address.clone()))
        });
    }
    #[cfg(not(feature = "zookeeper"))]
    let _ = address;
}
