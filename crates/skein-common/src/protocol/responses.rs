//! Skein Response Types
//!
//! This module defines the RPC response structure and its status codes.

use serde::{Deserialize, Serialize};

use super::requests::{RequestId, RpcValue};

/// Outcome category carried in every [`RpcResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// The handler ran and produced a value.
    Success,
    /// No registration matches the requested service or method.
    ServiceNotFound,
    /// The handler (or parameter decoding) failed.
    Fail,
}

impl ResponseCode {
    pub fn code(self) -> u16 {
        match self {
            ResponseCode::Success => 200,
            ResponseCode::ServiceNotFound => 404,
            ResponseCode::Fail => 500,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ResponseCode::Success => "The remote call is successful",
            ResponseCode::ServiceNotFound => "The remote service was not found",
            ResponseCode::Fail => "The remote call failed",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(ResponseCode::Success),
            404 => Some(ResponseCode::ServiceNotFound),
            500 => Some(ResponseCode::Fail),
            _ => None,
        }
    }
}

/// An RPC response returned from a provider to the client.
///
/// # Response Flow
///
/// 1. Provider receives and dispatches an `RpcRequest`
/// 2. Provider creates an `RpcResponse` (success or failure)
/// 3. The response travels back in a frame with the request's serializer and compressor ids
/// 4. The client matches it to the waiting caller by `request_id`
///
/// # Example
///
/// ```
/// use skein_common::protocol::responses::{ResponseCode, RpcResponse};
/// use serde_json::json;
///
/// let ok = RpcResponse::success("req-1", json!({"pi": 3.14159}));
/// assert!(ok.is_success());
///
/// let failed = RpcResponse::fail("req-2", ResponseCode::Fail, "division by zero");
/// assert_eq!(failed.code, 500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    /// Request identifier this response corresponds to
    pub request_id: RequestId,
    /// Numeric status (200, 404 or 500)
    pub code: u16,
    /// Human readable status or failure description
    pub message: String,
    /// Result value, present on success.
    ///
    /// A `null` result decodes back as `None`.
    pub data: Option<RpcValue>,
}

impl RpcResponse {
    /// Creates a successful response.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request identifier (must match the request's ID)
    /// * `data` - The result value
    pub fn success(request_id: impl Into<RequestId>, data: RpcValue) -> Self {
        RpcResponse {
            request_id: request_id.into(),
            code: ResponseCode::Success.code(),
            message: ResponseCode::Success.message().to_string(),
            data: if data.is_null() { None } else { Some(data) },
        }
    }

    /// Creates a failure response.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request identifier
    /// * `code` - `ServiceNotFound` or `Fail`
    /// * `detail` - What went wrong, appended to the code's message
    pub fn fail(request_id: impl Into<RequestId>, code: ResponseCode, detail: impl AsRef<str>) -> Self {
        RpcResponse {
            request_id: request_id.into(),
            code: code.code(),
            message: format!("{}: {}", code.message(), detail.as_ref()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success.code()
    }
}
