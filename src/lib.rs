//! Skein RPC
//!
//! Call methods on services implemented by other processes as if they were
//! local. Providers publish themselves in a coordination service; consumers
//! discover them, pick one with a load balancer and talk to it over a
//! multiplexed binary frame protocol.
//!
//! # Crates
//!
//! - [`skein_common`]: protocol types, frame codec, extension loader, config
//! - [`skein_balance`]: round-robin and least-active load balancers
//! - [`skein_registry`]: publication and discovery over a coordinator
//! - [`skein_client`]: connection pool, pending requests and proxies
//! - [`skein_server`]: accept loop, method dispatch and worker pool
//!
//! This crate ties them together in an [`RpcContext`].

pub mod config;
pub mod context;

pub use config::RpcConfig;
pub use context::{Extensions, RpcContext, RpcContextBuilder};

pub use skein_client::ServiceProxy;
pub use skein_common::{Result, RpcError, ServiceAddress, ServiceKey};
pub use skein_registry::MemoryEnsemble;
pub use skein_server::{ServiceDefinition, ServiceError};

pub use skein_balance;
pub use skein_client;
pub use skein_common;
pub use skein_registry;
pub use skein_server;
