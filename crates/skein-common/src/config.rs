//! Key/value configuration sources and typed readers.
//!
//! Components read their settings through a [`ConfigSource`] so the process
//! can inject configuration from anywhere: a `HashMap`, a properties file,
//! or an adapter over environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::error::{Result, RpcError};

/// Configuration keys understood by the Skein components.
pub mod keys {
    pub const REGISTRY_ADDRESS: &str = "rpc.registry.address";
    pub const REGISTRY_ROOT: &str = "rpc.registry.root";
    pub const REGISTRY_CONNECT_TIMEOUT_MS: &str = "rpc.registry.connect_timeout_ms";
    pub const REGISTRY_COORDINATOR: &str = "rpc.registry.coordinator";
    pub const CLIENT_LOAD_BALANCE: &str = "rpc.client.load_balance";
    pub const CLIENT_REQUEST_TIMEOUT_MS: &str = "rpc.client.request_timeout_ms";
    pub const CLIENT_CONNECT_TIMEOUT_MS: &str = "rpc.client.connect_timeout_ms";
    pub const CLIENT_HEARTBEAT_INTERVAL_MS: &str = "rpc.client.heartbeat_interval_ms";
    pub const CLIENT_SERIALIZER: &str = "rpc.client.serializer";
    pub const CLIENT_COMPRESSOR: &str = "rpc.client.compressor";
    pub const SERVER_BIND: &str = "rpc.server.bind";
    pub const SERVER_ADVERTISE_HOST: &str = "rpc.server.advertise_host";
    pub const SERVER_IDLE_TIMEOUT_MS: &str = "rpc.server.idle_timeout_ms";
    pub const SERVER_WORKER_THREADS: &str = "rpc.server.worker_threads";
    pub const CODEC_MAX_FRAME_BYTES: &str = "rpc.codec.max_frame_bytes";
    pub const EXTENSION_DIR: &str = "rpc.extension.dir";
    pub const TRANSPORT: &str = "rpc.transport";
}

/// A read-only key/value configuration provider.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// `key=value` properties text.
///
/// `#` and `!` start comment lines; keys and values are trimmed. Later
/// occurrences of a key win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn parse(text: &str) -> Self {
        let values = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Properties { values }
    }

    /// Reads and parses a properties file.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` if the file cannot be read.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| RpcError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Ok(Self::parse(&text))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl ConfigSource for Properties {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

pub fn read_string(source: &dyn ConfigSource, key: &str, default: &str) -> String {
    source.get(key).unwrap_or_else(|| default.to_string())
}

pub fn read_optional(source: &dyn ConfigSource, key: &str) -> Option<String> {
    source.get(key).filter(|v| !v.is_empty())
}

pub fn read_path(source: &dyn ConfigSource, key: &str) -> Option<PathBuf> {
    read_optional(source, key).map(PathBuf::from)
}

/// Reads an unsigned integer.
///
/// # Errors
///
/// Returns `RpcError::Config` naming the key when the value does not parse.
pub fn read_u64(source: &dyn ConfigSource, key: &str, default: u64) -> Result<u64> {
    match source.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|e| RpcError::Config(format!("invalid value '{}' for {}: {}", raw, key, e))),
        None => Ok(default),
    }
}

pub fn read_usize(source: &dyn ConfigSource, key: &str, default: usize) -> Result<usize> {
    let value = read_u64(source, key, default as u64)?;
    usize::try_from(value)
        .map_err(|e| RpcError::Config(format!("value {} for {} out of range: {}", value, key, e)))
}

/// Reads a millisecond duration.
pub fn read_millis(source: &dyn ConfigSource, key: &str, default: Duration) -> Result<Duration> {
    read_u64(source, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_parse() {
        let props = Properties::parse(
            "# comment\n! also comment\nrpc.server.bind = 127.0.0.1:1\n\nbroken\nrpc.a=1\nrpc.a=2\n",
        );
        assert_eq!(props.get("rpc.server.bind").as_deref(), Some("127.0.0.1:1"));
        assert_eq!(props.get("rpc.a").as_deref(), Some("2"));
        assert_eq!(props.get("broken"), None);
    }

    #[test]
    fn test_properties_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rpc.properties");
        std::fs::write(&path, "rpc.client.load_balance=roundRobin\n").unwrap();

        let props = Properties::load(&path).unwrap();
        assert_eq!(read_string(&props, keys::CLIENT_LOAD_BALANCE, "x"), "roundRobin");
        assert!(Properties::load(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_read_numbers() {
        let mut source = HashMap::new();
        source.insert("n".to_string(), " 42 ".to_string());
        source.insert("bad".to_string(), "forty".to_string());

        assert_eq!(read_u64(&source, "n", 1).unwrap(), 42);
        assert_eq!(read_u64(&source, "absent", 7).unwrap(), 7);
        assert!(matches!(read_u64(&source, "bad", 1), Err(RpcError::Config(_))));
        assert_eq!(
            read_millis(&source, "n", Duration::from_secs(1)).unwrap(),
            Duration::from_millis(42)
        );
    }

    #[test]
    fn test_read_optional_ignores_empty() {
        let mut source = HashMap::new();
        source.insert("empty".to_string(), String::new());
        assert_eq!(read_optional(&source, "empty"), None);
        assert_eq!(read_path(&source, "absent"), None);
    }
}
