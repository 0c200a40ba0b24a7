pub mod error;
pub mod message;
pub mod params;
pub mod requests;
pub mod responses;
pub mod service_key;

#[cfg(test)]
mod tests;

pub use error::{Result, RpcError};
pub use message::{MessageBody, MessageType, RpcMessage};
pub use params::{type_descriptor, Params};
pub use requests::{generate_request_id, MethodName, RequestId, RpcRequest, RpcValue, TypeDescriptor};
pub use responses::{ResponseCode, RpcResponse};
pub use service_key::{ServiceAddress, ServiceKey};
