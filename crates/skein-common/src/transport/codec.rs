//! Frame codec.
//!
//! Every message travels in one frame (all integers big-endian):
//!
//! ```text
//! [u32 total length][u8 magic][u8 serializer id][u8 compressor id][u8 message type]
//! [u32 request-id length][request-id bytes][u32 body length][body bytes]
//! ```
//!
//! `total length` includes its own four bytes. Heartbeat frames carry an
//! empty body and are never passed through a serializer or compressor.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::formats::Formats;
use crate::protocol::error::{Result, RpcError};
use crate::protocol::{MessageBody, MessageType, RpcMessage};

/// Magic/version byte opening every frame.
pub const PROTOCOL_MAGIC: u8 = 0x5B;

/// Default upper bound on a frame's declared length (8 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Length prefix, magic, serializer, compressor, type, and the two inner lengths.
const MIN_FRAME_LEN: usize = 4 + 4 + 4 + 4;

/// Encodes and decodes [`RpcMessage`] frames.
///
/// Implements `tokio_util`'s `Encoder`/`Decoder`, so it plugs into
/// `FramedRead`/`FramedWrite`. The decoder returns `Ok(None)` until a full
/// frame is buffered, which handles frames split across reads.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use skein_common::transport::FrameCodec;
/// use skein_common::RpcMessage;
/// use tokio_util::codec::{Decoder, Encoder};
///
/// let mut codec = FrameCodec::default();
/// let mut buf = BytesMut::new();
/// codec.encode(RpcMessage::ping(0x01, 0x00), &mut buf).unwrap();
///
/// let decoded = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(decoded, RpcMessage::ping(0x01, 0x00));
/// ```
#[derive(Clone)]
pub struct FrameCodec {
    formats: Arc<Formats>,
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new(formats: Arc<Formats>, max_frame_bytes: usize) -> Self {
        FrameCodec {
            formats,
            max_frame_bytes,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Appends one encoded frame to `dst`.
    ///
    /// # Errors
    ///
    /// - `MalformedFrame` if the body does not match the message type, a
    ///   format id is unknown, or the frame would exceed the maximum size
    ///   either on the wire or once decompressed
    /// - serializer errors from encoding the body
    pub fn write_frame(&self, message: &RpcMessage, dst: &mut BytesMut) -> Result<()> {
        let body = self.encode_body(message)?;
        let request_id = message.request_id.as_bytes();

        let total = MIN_FRAME_LEN + request_id.len() + body.len();
        if total > self.max_frame_bytes {
            return Err(RpcError::MalformedFrame(format!(
                "frame of {} bytes exceeds maximum of {} bytes",
                total, self.max_frame_bytes
            )));
        }

        dst.reserve(total);
        dst.put_u32(total as u32);
        dst.put_u8(PROTOCOL_MAGIC);
        dst.put_u8(message.serializer);
        dst.put_u8(message.compressor);
        dst.put_u8(message.message_type as u8);
        dst.put_u32(request_id.len() as u32);
        dst.put_slice(request_id);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }

    /// Decodes one complete frame, length prefix included.
    pub fn read_frame(&self, mut frame: Bytes) -> Result<RpcMessage> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(RpcError::MalformedFrame(format!(
                "frame of {} bytes is shorter than the {} byte header",
                frame.len(),
                MIN_FRAME_LEN
            )));
        }
        frame.advance(4);

        let magic = frame.get_u8();
        if magic != PROTOCOL_MAGIC {
            return Err(RpcError::MalformedFrame(format!(
                "bad magic byte {:#04x}",
                magic
            )));
        }
        let serializer = frame.get_u8();
        let compressor = frame.get_u8();
        let message_type = MessageType::try_from(frame.get_u8())?;

        let id_len = frame.get_u32() as usize;
        if frame.remaining() < id_len + 4 {
            return Err(RpcError::MalformedFrame(format!(
                "request id length {} overruns frame",
                id_len
            )));
        }
        let request_id = String::from_utf8(frame.split_to(id_len).to_vec())
            .map_err(|e| RpcError::MalformedFrame(format!("request id is not UTF-8: {}", e)))?;

        let body_len = frame.get_u32() as usize;
        if frame.remaining() != body_len {
            return Err(RpcError::MalformedFrame(format!(
                "body length {} does not match remaining {} bytes",
                body_len,
                frame.remaining()
            )));
        }

        let body = self.decode_body(message_type, serializer, compressor, &frame)?;
        Ok(RpcMessage {
            message_type,
            serializer,
            compressor,
            request_id,
            body,
        })
    }

    fn encode_body(&self, message: &RpcMessage) -> Result<Vec<u8>> {
        let serialized = match (message.message_type, &message.body) {
            (MessageType::HeartbeatPing | MessageType::HeartbeatPong, MessageBody::Empty) => {
                return Ok(Vec::new());
            }
            (MessageType::Request, MessageBody::Request(request)) => self
                .formats
                .serializer(message.serializer)?
                .encode_request(request)?,
            (MessageType::Response, MessageBody::Response(response)) => self
                .formats
                .serializer(message.serializer)?
                .encode_response(response)?,
            (message_type, _) => {
                return Err(RpcError::MalformedFrame(format!(
                    "body does not match message type {:?}",
                    message_type
                )));
            }
        };
        if serialized.len() > self.max_frame_bytes {
            return Err(RpcError::MalformedFrame(format!(
                "body of {} bytes exceeds maximum of {} bytes before compression",
                serialized.len(),
                self.max_frame_bytes
            )));
        }
        self.formats
            .compressor(message.compressor)?
            .compress(&serialized)
    }

    fn decode_body(
        &self,
        message_type: MessageType,
        serializer: u8,
        compressor: u8,
        body: &[u8],
    ) -> Result<MessageBody> {
        if message_type.is_heartbeat() {
            if !body.is_empty() {
                return Err(RpcError::MalformedFrame(
                    "heartbeat frame carries a body".to_string(),
                ));
            }
            return Ok(MessageBody::Empty);
        }

        let serializer = self.formats.serializer(serializer)?;
        let raw = self
            .formats
            .compressor(compressor)?
            .decompress(body, self.max_frame_bytes)
            .map_err(|e| match e {
                RpcError::MalformedFrame(_) => e,
                other => RpcError::MalformedFrame(format!("cannot decompress body: {}", other)),
            })?;

        let decoded = match message_type {
            MessageType::Request => serializer.decode_request(&raw).map(MessageBody::Request),
            _ => serializer.decode_response(&raw).map(MessageBody::Response),
        };
        decoded.map_err(|e| RpcError::MalformedFrame(format!("cannot decode body: {}", e)))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(Arc::new(Formats::builtin()), DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = RpcMessage;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RpcMessage>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if declared > self.max_frame_bytes {
            return Err(RpcError::MalformedFrame(format!(
                "declared frame length {} exceeds maximum of {} bytes",
                declared, self.max_frame_bytes
            )));
        }
        if declared < MIN_FRAME_LEN {
            return Err(RpcError::MalformedFrame(format!(
                "declared frame length {} is shorter than the header",
                declared
            )));
        }

        if src.len() < declared {
            src.reserve(declared - src.len());
            return Ok(None);
        }

        let frame = src.split_to(declared).freeze();
        self.read_frame(frame).map(Some)
    }
}

impl Encoder<RpcMessage> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, item: RpcMessage, dst: &mut BytesMut) -> Result<()> {
        self.write_frame(&item, dst)
    }
}
