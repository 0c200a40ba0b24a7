//! Id-indexed tables of serializers and compressors used by the codec.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::compress::{Compressor, GzipCompressor, NoCompression};
use super::serialize::{JsonSerializer, MsgPackSerializer, Serializer};
use crate::extension::ExtensionLoader;
use crate::protocol::error::{Result, RpcError};

/// Registers the built-in serializers in a loader's catalog.
pub fn register_builtin_serializers(loader: &ExtensionLoader<dyn Serializer>) {
    loader.register("skein_common::transport::JsonSerializer", || Arc::new(JsonSerializer));
    loader.register("skein_common::transport::MsgPackSerializer", || Arc::new(MsgPackSerializer));
}

/// Registers the built-in compressors in a loader's catalog.
pub fn register_builtin_compressors(loader: &ExtensionLoader<dyn Compressor>) {
    loader.register("skein_common::transport::NoCompression", || Arc::new(NoCompression));
    loader.register("skein_common::transport::GzipCompressor", || Arc::new(GzipCompressor));
}

/// The formats a codec can read and write, indexed by wire id.
#[derive(Clone)]
pub struct Formats {
    serializers: HashMap<u8, Arc<dyn Serializer>>,
    compressors: HashMap<u8, Arc<dyn Compressor>>,
}

impl Formats {
    /// JSON, MessagePack, no compression and gzip.
    pub fn builtin() -> Self {
        let mut formats = Formats {
            serializers: HashMap::new(),
            compressors: HashMap::new(),
        };
        formats.add_serializer(Arc::new(JsonSerializer));
        formats.add_serializer(Arc::new(MsgPackSerializer));
        formats.add_compressor(Arc::new(NoCompression));
        formats.add_compressor(Arc::new(GzipCompressor));
        formats
    }

    /// Instantiates every configured serializer and compressor.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ExtensionNotFound` if a configured name has no
    /// factory in the loader's catalog.
    pub fn from_extensions(
        serializers: &ExtensionLoader<dyn Serializer>,
        compressors: &ExtensionLoader<dyn Compressor>,
    ) -> Result<Self> {
        let mut formats = Formats {
            serializers: HashMap::new(),
            compressors: HashMap::new(),
        };
        for name in serializers.names() {
            formats.add_serializer(serializers.get(&name)?);
        }
        for name in compressors.names() {
            formats.add_compressor(compressors.get(&name)?);
        }
        Ok(formats)
    }

    pub fn add_serializer(&mut self, serializer: Arc<dyn Serializer>) {
        if let Some(previous) = self.serializers.insert(serializer.id(), serializer.clone()) {
            warn!(
                id = serializer.id(),
                replaced = previous.name(),
                by = serializer.name(),
                "Serializer id registered twice"
            );
        }
    }

    pub fn add_compressor(&mut self, compressor: Arc<dyn Compressor>) {
        if let Some(previous) = self.compressors.insert(compressor.id(), compressor.clone()) {
            warn!(
                id = compressor.id(),
                replaced = previous.name(),
                by = compressor.name(),
                "Compressor id registered twice"
            );
        }
    }

    /// # Errors
    ///
    /// Returns `RpcError::MalformedFrame` for an unknown id.
    pub fn serializer(&self, id: u8) -> Result<&Arc<dyn Serializer>> {
        self.serializers
            .get(&id)
            .ok_or_else(|| RpcError::MalformedFrame(format!("unknown serialization id {:#04x}", id)))
    }

    /// # Errors
    ///
    /// Returns `RpcError::MalformedFrame` for an unknown id.
    pub fn compressor(&self, id: u8) -> Result<&Arc<dyn Compressor>> {
        self.compressors
            .get(&id)
            .ok_or_else(|| RpcError::MalformedFrame(format!("unknown compression id {:#04x}", id)))
    }

    pub fn serializer_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.serializers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn compressor_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.compressors.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for Formats {
    fn default() -> Self {
        Self::builtin()
    }
}
