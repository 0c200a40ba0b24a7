//! Skein Transport Layer
//!
//! This module turns [`RpcMessage`](crate::protocol::RpcMessage)s into frames
//! and back.
//!
//! # Components
//!
//! - **[`FrameCodec`]**: `tokio_util` encoder/decoder for the binary frame
//! - **[`Serializer`]**: body formats (**[`JsonSerializer`]**, **[`MsgPackSerializer`]**)
//! - **[`Compressor`]**: body compression (**[`NoCompression`]**, **[`GzipCompressor`]**)
//! - **[`Formats`]**: id-indexed tables built from the extension loaders
//! - **[`Transport`]**: byte streams the frames travel over (**[`TcpTransport`]**)
//!
//! # Message Size Limits
//!
//! Decoding rejects any frame whose declared length exceeds the configured
//! maximum (8 MiB by default) before buffering it, and any body that would
//! decompress past the same maximum.

pub mod codec;
pub mod compress;
pub mod formats;
pub mod net;
pub mod serialize;

pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_BYTES, PROTOCOL_MAGIC};
pub use compress::{Compressor, GzipCompressor, NoCompression, GZIP_COMPRESSOR_ID, NO_COMPRESSION_ID};
pub use formats::{register_builtin_compressors, register_builtin_serializers, Formats};
pub use net::{
    register_builtin_transports, BoxedStream, TcpTransport, Transport, TransportListener, TransportStream,
};
pub use serialize::{JsonSerializer, MsgPackSerializer, Serializer, JSON_SERIALIZER_ID, MSGPACK_SERIALIZER_ID};
