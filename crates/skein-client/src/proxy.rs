use serde::de::DeserializeOwned;
use skein_common::{Params, Result, RpcError, RpcRequest, RpcResponse, RpcValue, ServiceKey, TypeDescriptor};

use crate::client::RpcClient;

/// A client bound to one service key.
///
/// # Example
///
/// ```no_run
/// # use skein_client::ServiceProxy;
/// # async fn demo(calc: ServiceProxy) -> skein_common::Result<()> {
/// let sum: i64 = calc.call("add", (2i64, 3i64)).await?;
/// let pong: String = calc.call("ping", ()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServiceProxy {
    client: RpcClient,
    service: ServiceKey,
}

impl ServiceProxy {
    pub fn new(client: RpcClient, service: ServiceKey) -> Self {
        Self { client, service }
    }

    pub fn service(&self) -> &ServiceKey {
        &self.service
    }

    /// Calls `method` with typed arguments and decodes the result.
    ///
    /// Parameter type descriptors are derived from `P`, so the call matches
    /// a server method registered with the same argument types.
    ///
    /// # Errors
    ///
    /// - `Remote` carrying the code and message of a `404` or `500` response
    /// - `JsonSerialization` if the result does not decode as `R`
    /// - any transport error from [`RpcClient::send`]
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Params,
        R: DeserializeOwned,
    {
        let response = self
            .invoke(method, P::type_descriptors(), params.into_values()?)
            .await?;
        if !response.is_success() {
            return Err(RpcError::Remote {
                code: response.code,
                message: response.message,
            });
        }
        Ok(serde_json::from_value(response.data.unwrap_or(RpcValue::Null))?)
    }

    /// Sends a raw call and returns the provider's response as-is.
    pub async fn invoke(
        &self,
        method: &str,
        param_types: Vec<TypeDescriptor>,
        parameters: Vec<RpcValue>,
    ) -> Result<RpcResponse> {
        let request = RpcRequest::new(&self.service, method, param_types, parameters);
        self.client.send(request).await
    }
}
