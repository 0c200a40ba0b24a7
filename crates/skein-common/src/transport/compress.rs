//! Body compressors.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::extension::Extension;
use crate::protocol::error::{Result, RpcError};

/// Transforms serialized bodies before they are framed.
pub trait Compressor: Send + Sync {
    /// Wire id written into the frame header.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Restores a compressed body.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::MalformedFrame` if the restored body would exceed
    /// `limit` bytes.
    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>>;
}

fn exceeds_limit(limit: usize) -> RpcError {
    RpcError::MalformedFrame(format!(
        "decompressed body exceeds maximum of {} bytes",
        limit
    ))
}

impl Extension for dyn Compressor {
    const CAPABILITY: &'static str = "compressor";
    const DEFAULT_CONFIG: &'static str = "\
none=skein_common::transport::NoCompression
gzip=skein_common::transport::GzipCompressor
";
}

pub const NO_COMPRESSION_ID: u8 = 0x00;
pub const GZIP_COMPRESSOR_ID: u8 = 0x01;

/// Passes bodies through unchanged.
pub struct NoCompression;

impl Compressor for NoCompression {
    fn id(&self) -> u8 {
        NO_COMPRESSION_ID
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        if data.len() > limit {
            return Err(exceeds_limit(limit));
        }
        Ok(data.to_vec())
    }
}

/// Gzip via `flate2`.
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn id(&self) -> u8 {
        GZIP_COMPRESSOR_ID
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
        // one byte past the limit tells an exact fit from an overflow
        GzDecoder::new(data)
            .take(limit as u64 + 1)
            .read_to_end(&mut out)?;
        if out.len() > limit {
            return Err(exceeds_limit(limit));
        }
        Ok(out)
    }
}
