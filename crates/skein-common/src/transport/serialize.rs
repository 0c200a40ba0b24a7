//! Body serializers.

use crate::extension::Extension;
use crate::protocol::error::Result;
use crate::protocol::{RpcRequest, RpcResponse};

/// Converts request and response bodies to and from bytes.
///
/// Each implementation owns a wire id written into the frame header; the
/// peer picks the same implementation by that id when decoding.
pub trait Serializer: Send + Sync {
    /// Wire id written into the frame header.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>>;

    fn decode_request(&self, data: &[u8]) -> Result<RpcRequest>;

    fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>>;

    fn decode_response(&self, data: &[u8]) -> Result<RpcResponse>;
}

impl Extension for dyn Serializer {
    const CAPABILITY: &'static str = "serializer";
    const DEFAULT_CONFIG: &'static str = "\
json=skein_common::transport::JsonSerializer
msgpack=skein_common::transport::MsgPackSerializer
";
}

pub const JSON_SERIALIZER_ID: u8 = 0x01;
pub const MSGPACK_SERIALIZER_ID: u8 = 0x02;

/// JSON bodies via `serde_json`.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn id(&self) -> u8 {
        JSON_SERIALIZER_ID
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn decode_request(&self, data: &[u8]) -> Result<RpcRequest> {
        Ok(serde_json::from_slice(data)?)
    }

    fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    fn decode_response(&self, data: &[u8]) -> Result<RpcResponse> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// MessagePack bodies via `rmp-serde`, structs encoded as maps.
pub struct MsgPackSerializer;

impl Serializer for MsgPackSerializer {
    fn id(&self) -> u8 {
        MSGPACK_SERIALIZER_ID
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(request)?)
    }

    fn decode_request(&self, data: &[u8]) -> Result<RpcRequest> {
        Ok(rmp_serde::from_slice(data)?)
    }

    fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(response)?)
    }

    fn decode_response(&self, data: &[u8]) -> Result<RpcResponse> {
        Ok(rmp_serde::from_slice(data)?)
    }
}
