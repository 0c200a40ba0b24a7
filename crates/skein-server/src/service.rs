//! Published services and request dispatch.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use skein_common::{
    Params, ResponseCode, RpcError, RpcRequest, RpcResponse, RpcValue, ServiceKey, TypeDescriptor,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Error returned by a service method.
///
/// Becomes a `500` response whose message carries the error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct ServiceError(String);

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for ServiceError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for ServiceError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<RpcError> for ServiceError {
    fn from(err: RpcError) -> Self {
        Self(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// What a method invocation resolves to.
pub type MethodFuture = BoxFuture<'static, Result<RpcValue, ServiceError>>;

type Invocable = Arc<dyn Fn(Vec<RpcValue>) -> MethodFuture + Send + Sync>;

/// Method name plus declared parameter types.
///
/// Two methods with the same name but different parameter types are distinct
/// overloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub name: String,
    pub param_types: Vec<TypeDescriptor>,
}

impl MethodSignature {
    pub fn new(name: impl Into<String>, param_types: Vec<TypeDescriptor>) -> Self {
        Self {
            name: name.into(),
            param_types,
        }
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.param_types.join(", "))
    }
}

/// The methods of one service implementation.
///
/// # Example
///
/// ```
/// use skein_server::{ServiceDefinition, ServiceError};
///
/// let calculator = ServiceDefinition::new()
///     .method("add", |(a, b): (i64, i64)| async move { Ok::<_, ServiceError>(a + b) })
///     .method("div", |(a, b): (i64, i64)| async move {
///         if b == 0 {
///             return Err(ServiceError::new("division by zero"));
///         }
///         Ok(a / b)
///     });
/// assert_eq!(calculator.len(), 2);
/// ```
#[derive(Default, Clone)]
pub struct ServiceDefinition {
    methods: HashMap<MethodSignature, Invocable>,
}

impl ServiceDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a typed method.
    ///
    /// The signature's parameter types are derived from `P`, matching what
    /// a typed proxy call with the same argument types declares. Parameters
    /// that fail to decode as `P` produce a `500` response without calling
    /// `handler`.
    pub fn method<P, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        P: Params,
        R: Serialize,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ServiceError>> + Send + 'static,
    {
        let invocable: Invocable = Arc::new(move |values: Vec<RpcValue>| match P::from_values(values) {
            Ok(params) => {
                let call = handler(params);
                async move { Ok::<_, ServiceError>(serde_json::to_value(call.await?)?) }.boxed()
            }
            Err(e) => future::ready(Err::<RpcValue, _>(ServiceError::from(e))).boxed(),
        });
        self.methods
            .insert(MethodSignature::new(name, P::type_descriptors()), invocable);
        self
    }

    /// Adds a method taking the raw parameter list under explicit descriptors.
    pub fn raw_method<F, Fut>(
        mut self,
        name: impl Into<String>,
        param_types: Vec<TypeDescriptor>,
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<RpcValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RpcValue, ServiceError>> + Send + 'static,
    {
        let invocable: Invocable = Arc::new(move |values: Vec<RpcValue>| handler(values).boxed());
        self.methods
            .insert(MethodSignature::new(name, param_types), invocable);
        self
    }

    pub fn signatures(&self) -> impl Iterator<Item = &MethodSignature> {
        self.methods.keys()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    fn find(&self, signature: &MethodSignature) -> Option<&Invocable> {
        self.methods.get(signature)
    }
}

/// Published implementations, keyed by service key.
///
/// Cloning is cheap and shares the table.
#[derive(Default, Clone)]
pub struct ServiceTable {
    services: Arc<DashMap<ServiceKey, Arc<ServiceDefinition>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `definition` under `service`, returning the one it replaced.
    pub fn insert(
        &self,
        service: ServiceKey,
        definition: ServiceDefinition,
    ) -> Option<Arc<ServiceDefinition>> {
        let previous = self.services.insert(service.clone(), Arc::new(definition));
        if previous.is_some() {
            warn!(service = %service, "Replaced published implementation");
        }
        previous
    }

    pub fn lookup(&self, service: &ServiceKey) -> Option<Arc<ServiceDefinition>> {
        self.services.get(service).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, service: &ServiceKey) -> Option<Arc<ServiceDefinition>> {
        self.services.remove(service).map(|(_, definition)| definition)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Runs `request` against the matching method.
    ///
    /// Always produces a response: `404` when no implementation or method
    /// matches, `500` when the method fails.
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let service = request.service_key();
        let Some(definition) = self.lookup(&service) else {
            debug!(request_id = %request.request_id, service = %service, "No implementation published");
            return RpcResponse::fail(
                request.request_id,
                ResponseCode::ServiceNotFound,
                format!("no implementation of {}", service),
            );
        };

        let signature = MethodSignature::new(request.method_name, request.param_types);
        let Some(invocable) = definition.find(&signature) else {
            debug!(request_id = %request.request_id, service = %service, method = %signature, "No matching method");
            return RpcResponse::fail(
                request.request_id,
                ResponseCode::ServiceNotFound,
                format!("no method {} on {}", signature, service),
            );
        };

        match invocable(request.parameters).await {
            Ok(data) => RpcResponse::success(request.request_id, data),
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    service = %service,
                    method = %signature.name,
                    error = %e,
                    "Method failed"
                );
                RpcResponse::fail(request.request_id, ResponseCode::Fail, e.message())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skein_common::type_descriptor;

    fn calculator() -> ServiceDefinition {
        ServiceDefinition::new()
            .method("add", |(a, b): (i64, i64)| async move { Ok::<_, ServiceError>(a + b) })
            .method("add", |(a, b): (String, String)| async move {
                Ok::<_, ServiceError>(format!("{}{}", a, b))
            })
            .method("div", |(a, b): (i64, i64)| async move {
                if b == 0 {
                    return Err(ServiceError::new("division by zero"));
                }
                Ok(a / b)
            })
            .method("reset", |(): ()| async { Ok::<_, ServiceError>(()) })
    }

    fn table() -> (ServiceTable, ServiceKey) {
        let key = ServiceKey::new("demo.Calculator");
        let table = ServiceTable::new();
        table.insert(key.clone(), calculator());
        (table, key)
    }

    fn request(key: &ServiceKey, method: &str, types: Vec<TypeDescriptor>, params: Vec<RpcValue>) -> RpcRequest {
        RpcRequest::new(key, method, types, params)
    }

    fn i64_pair() -> Vec<TypeDescriptor> {
        vec![type_descriptor::<i64>(), type_descriptor::<i64>()]
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let (table, key) = table();
        let response = table
            .dispatch(request(&key, "add", i64_pair(), vec![json!(2), json!(3)]))
            .await;
        assert!(response.is_success());
        assert_eq!(response.data, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_dispatch_picks_overload_by_types() {
        let (table, key) = table();
        let types = vec![type_descriptor::<String>(), type_descriptor::<String>()];
        let response = table
            .dispatch(request(&key, "add", types, vec![json!("ab"), json!("cd")]))
            .await;
        assert_eq!(response.data, Some(json!("abcd")));
    }

    #[tokio::test]
    async fn test_unit_result_has_no_data() {
        let (table, key) = table();
        let response = table.dispatch(request(&key, "reset", vec![], vec![])).await;
        assert!(response.is_success());
        assert_eq!(response.data, None);
    }

    #[tokio::test]
    async fn test_unknown_service_is_404() {
        let (table, _) = table();
        let other = ServiceKey::new("demo.Calculator").with_version("2.0");
        let response = table.dispatch(request(&other, "add", i64_pair(), vec![json!(1), json!(1)])).await;
        assert_eq!(response.code, 404);
        assert!(response.message.contains("demo.Calculator"));
    }

    #[tokio::test]
    async fn test_unknown_method_is_404() {
        let (table, key) = table();
        let response = table.dispatch(request(&key, "mul", i64_pair(), vec![json!(1), json!(1)])).await;
        assert_eq!(response.code, 404);
    }

    #[tokio::test]
    async fn test_mismatched_types_is_404() {
        let (table, key) = table();
        let types = vec![type_descriptor::<f64>(), type_descriptor::<f64>()];
        let response = table.dispatch(request(&key, "add", types, vec![json!(1.5), json!(1.5)])).await;
        assert_eq!(response.code, 404);
    }

    #[tokio::test]
    async fn test_handler_error_is_500() {
        let (table, key) = table();
        let response = table.dispatch(request(&key, "div", i64_pair(), vec![json!(1), json!(0)])).await;
        assert_eq!(response.code, 500);
        assert!(response.message.ends_with("division by zero"));
    }

    #[tokio::test]
    async fn test_undecodable_params_is_500() {
        let (table, key) = table();
        let response = table
            .dispatch(request(&key, "add", i64_pair(), vec![json!("two"), json!(3)]))
            .await;
        assert_eq!(response.code, 500);

        let response = table.dispatch(request(&key, "add", i64_pair(), vec![json!(1)])).await;
        assert_eq!(response.code, 500);
    }

    #[tokio::test]
    async fn test_raw_method() {
        let key = ServiceKey::new("demo.Raw");
        let table = ServiceTable::new();
        table.insert(
            key.clone(),
            ServiceDefinition::new().raw_method("count", vec!["list".to_string()], |values| async move {
                Ok(json!(values.len()))
            }),
        );

        let response = table
            .dispatch(request(&key, "count", vec!["list".to_string()], vec![json!([1, 2])]))
            .await;
        assert_eq!(response.data, Some(json!(1)));
    }

    #[test]
    fn test_insert_replaces() {
        let (table, key) = table();
        assert!(table.insert(key.clone(), ServiceDefinition::new()).is_some());
        assert_eq!(table.len(), 1);
        assert!(table.lookup(&key).unwrap().is_empty());
        assert!(table.remove(&key).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_signature_display() {
        let signature = MethodSignature::new("add", vec!["i64".to_string(), "i64".to_string()]);
        assert_eq!(signature.to_string(), "add(i64, i64)");
    }
}
