//! The unit carried by one wire frame.

use super::error::{Result, RpcError};
use super::requests::{RequestId, RpcRequest};
use super::responses::RpcResponse;

/// Kind of payload carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    HeartbeatPing = 3,
    HeartbeatPong = 4,
}

impl MessageType {
    pub fn is_heartbeat(self) -> bool {
        matches!(self, MessageType::HeartbeatPing | MessageType::HeartbeatPong)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::HeartbeatPing),
            4 => Ok(MessageType::HeartbeatPong),
            other => Err(RpcError::MalformedFrame(format!(
                "unknown message type {}",
                other
            ))),
        }
    }
}

/// Decoded payload of a frame. Heartbeats carry no body.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Request(RpcRequest),
    Response(RpcResponse),
    Empty,
}

/// One framed message: envelope fields plus the decoded body.
///
/// `serializer` and `compressor` are the wire ids of the formats used for
/// the body. Responses echo the ids of the request they answer.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    pub message_type: MessageType,
    pub serializer: u8,
    pub compressor: u8,
    pub request_id: RequestId,
    pub body: MessageBody,
}

impl RpcMessage {
    pub fn request(request: RpcRequest, serializer: u8, compressor: u8) -> Self {
        RpcMessage {
            message_type: MessageType::Request,
            serializer,
            compressor,
            request_id: request.request_id.clone(),
            body: MessageBody::Request(request),
        }
    }

    pub fn response(response: RpcResponse, serializer: u8, compressor: u8) -> Self {
        RpcMessage {
            message_type: MessageType::Response,
            serializer,
            compressor,
            request_id: response.request_id.clone(),
            body: MessageBody::Response(response),
        }
    }

    pub fn ping(serializer: u8, compressor: u8) -> Self {
        Self::heartbeat(MessageType::HeartbeatPing, serializer, compressor)
    }

    pub fn pong(serializer: u8, compressor: u8) -> Self {
        Self::heartbeat(MessageType::HeartbeatPong, serializer, compressor)
    }

    fn heartbeat(message_type: MessageType, serializer: u8, compressor: u8) -> Self {
        RpcMessage {
            message_type,
            serializer,
            compressor,
            request_id: RequestId::new(),
            body: MessageBody::Empty,
        }
    }
}
