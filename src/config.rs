use std::path::{Path, PathBuf};

use skein_client::ClientConfig;
use skein_common::config::{self, keys, ConfigSource, Properties};
use skein_common::Result;
use skein_registry::RegistryConfig;
use skein_server::ServerConfig;

/// Configuration for an [`RpcContext`](crate::RpcContext).
///
/// Groups the registry, client and server settings with the extension
/// directory. Every key is optional; see each part for its defaults.
///
/// # Example
///
/// ```
/// use skein::RpcConfig;
///
/// let config = RpcConfig::from_properties(
///     "# consumer side\n\
///      rpc.client.load_balance=roundRobin\n\
///      rpc.client.serializer=msgpack\n",
/// )
/// .unwrap();
/// assert_eq!(config.client.load_balance, "roundRobin");
/// assert_eq!(config.registry.root, "/skein-rpc");
/// ```
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub registry: RegistryConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
    /// `transport` extension used by both the server and the client.
    pub transport: String,
    /// Directory holding one `name=implementation-id` file per capability.
    /// When unset, the built-in tables are used.
    pub extension_dir: Option<PathBuf>,
}

pub const DEFAULT_TRANSPORT: &str = "tcp";

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            transport: DEFAULT_TRANSPORT.to_string(),
            extension_dir: None,
        }
    }
}

impl RpcConfig {
    /// Reads every `rpc.*` key from `source`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` for unparseable numbers or an invalid
    /// registry root.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        Ok(Self {
            registry: RegistryConfig::from_source(source)?,
            client: ClientConfig::from_source(source)?,
            server: ServerConfig::from_source(source)?,
            transport: config::read_string(source, keys::TRANSPORT, DEFAULT_TRANSPORT),
            extension_dir: config::read_path(source, keys::EXTENSION_DIR),
        })
    }

    /// Parses `key=value` properties text.
    pub fn from_properties(text: &str) -> Result<Self> {
        Self::from_source(&Properties::parse(text))
    }

    /// Reads a properties file.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` if the file cannot be read or holds
    /// invalid values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_source(&Properties::load(path)?)
    }
}
