//! Skein Common Types and Transport
//!
//! This crate provides the protocol definitions, binary frame codec,
//! extension loading and configuration shared by every Skein component.
//!
//! # Overview
//!
//! Skein is a service-oriented RPC framework: providers publish services
//! under a [`ServiceKey`] into a coordination service, and consumers call
//! them through proxies that discover providers, balance load across them,
//! and multiplex calls over one pooled connection per provider.
//!
//! - **Protocol Layer**: [`RpcRequest`], [`RpcResponse`], [`RpcMessage`], [`RpcError`]
//! - **Transport Layer**: [`FrameCodec`](transport::FrameCodec) with pluggable
//!   serializers and compressors
//! - **Extensions**: [`ExtensionLoader`](extension::ExtensionLoader) for
//!   choosing implementations by configured name
//! - **Configuration**: [`ConfigSource`](config::ConfigSource) and typed readers
//!
//! # Example
//!
//! ```
//! use skein_common::{RpcRequest, RpcResponse, ServiceKey};
//! use serde_json::json;
//!
//! let key = ServiceKey::new("demo.Echo").with_version("1.0");
//! let request = RpcRequest::new(&key, "echo", vec![], vec![json!("hi")]);
//!
//! let response = RpcResponse::success(request.request_id.clone(), json!("hi"));
//! assert!(response.is_success());
//! ```

pub mod config;
pub mod extension;
pub mod protocol;
pub mod transport;

pub use protocol::*;
