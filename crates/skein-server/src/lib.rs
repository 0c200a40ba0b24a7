//! Skein Server
//!
//! Accepts connections, decodes request frames and runs the matching method
//! on a bounded worker pool, so slow handlers never stall connection I/O.
//!
//! - [`ServiceDefinition`]: the methods of one published implementation
//! - [`ServiceTable`]: service key → definition, with request dispatch
//! - [`WorkerPool`]: bounded, drainable pool for handler execution
//! - [`RpcServer`]: the accept loop, per-connection reader/writer tasks and
//!   registry publication
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use skein_common::transport::{Formats, TcpTransport};
//! use skein_common::ServiceKey;
//! use skein_server::{RpcServer, ServerConfig, ServiceDefinition, ServiceError};
//!
//! # async fn demo() -> skein_common::Result<()> {
//! let server = RpcServer::bind(
//!     ServerConfig::default(),
//!     Arc::new(TcpTransport),
//!     Arc::new(Formats::builtin()),
//!     None,
//! )
//! .await?;
//! let echo = ServiceDefinition::new()
//!     .method("ping", |(): ()| async { Ok::<_, ServiceError>("pong".to_string()) });
//! server.publish(ServiceKey::new("demo.Echo"), echo).await?;
//! server.spawn()?;
//! # Ok(())
//! # }
//! ```

pub mod server;
pub mod service;
pub mod worker;

pub use server::{RpcServer, ServerConfig};
pub use service::{MethodFuture, MethodSignature, ServiceDefinition, ServiceError, ServiceTable};
pub use worker::WorkerPool;
