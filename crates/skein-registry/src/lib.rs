//! Skein Registry
//!
//! Providers publish `<root>/<service key>/<host:port>` as ephemeral entries
//! in a coordination service; consumers resolve a service key to the current
//! provider list, kept fresh by child watches.
//!
//! - [`Coordinator`]: the seam to the coordination service
//! - [`MemoryEnsemble`] / [`MemoryCoordinator`]: in-process coordination
//!   service with ephemeral nodes, child watches and session simulation
//! - `ZooKeeperCoordinator` (feature `zookeeper`): sessions on an Apache
//!   ZooKeeper ensemble
//! - [`ServiceRegistry`]: publish, resolve, unpublish and the reconnection flow
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use skein_common::{ServiceAddress, ServiceKey};
//! use skein_registry::{MemoryEnsemble, RegistryConfig, ServiceRegistry};
//!
//! # async fn demo() -> skein_common::Result<()> {
//! let ensemble = MemoryEnsemble::new();
//! let registry = ServiceRegistry::connect(
//!     Arc::new(ensemble.session()),
//!     RegistryConfig::default(),
//! )
//! .await?;
//!
//! let key = ServiceKey::new("demo.Echo");
//! registry.publish(&key, &ServiceAddress::new("127.0.0.1", 9998)).await?;
//! assert_eq!(registry.resolve(&key).await?.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod registry;

pub use coordinator::memory::{MemoryCoordinator, MemoryEnsemble};
#[cfg(feature = "zookeeper")]
pub use coordinator::zookeeper::ZooKeeperCoordinator;
pub use coordinator::{
    register_builtin_coordinators, ChildEvent, ChildWatch, Coordinator, CreateOutcome, SessionEvent,
};
pub use registry::{ConnectionState, RegistryConfig, ServiceDiscovery, ServiceRegistry};
