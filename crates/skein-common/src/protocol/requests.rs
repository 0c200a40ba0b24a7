use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::service_key::ServiceKey;

pub type RequestId = String;
pub type MethodName = String;
pub type TypeDescriptor = String;
pub type RpcValue = serde_json::Value;

/// A method invocation sent from a client to a provider.
///
/// `param_types` carries one descriptor per parameter so that the server can
/// pick between methods that share a name. The descriptors come from
/// [`type_descriptor`](super::params::type_descriptor) on both sides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub request_id: RequestId,
    pub interface_name: String,
    pub method_name: MethodName,
    pub parameters: Vec<RpcValue>,
    pub param_types: Vec<TypeDescriptor>,
    pub version: String,
    pub group: String,
}

impl RpcRequest {
    pub fn new(
        service: &ServiceKey,
        method_name: impl Into<String>,
        param_types: Vec<TypeDescriptor>,
        parameters: Vec<RpcValue>,
    ) -> Self {
        RpcRequest {
            request_id: generate_request_id(),
            interface_name: service.interface.clone(),
            method_name: method_name.into(),
            parameters,
            param_types,
            version: service.version.clone(),
            group: service.group.clone(),
        }
    }

    /// The service this request targets.
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey {
            interface: self.interface_name.clone(),
            group: self.group.clone(),
            version: self.version.clone(),
        }
    }
}

/// Generates a globally unique request id (random UUID v4).
pub fn generate_request_id() -> RequestId {
    Uuid::new_v4().to_string()
}
