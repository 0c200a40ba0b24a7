//! Service identity and provider addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{Result, RpcError};

/// Separator between the interface, group and version of a service key.
const KEY_SEPARATOR: char = '#';

/// Identity of a published service: interface name plus group and version.
///
/// Two services with the same interface but different group or version are
/// distinct registrations. The canonical text form is
/// `interface#group#version` and is what the registry, the server's
/// registration table and the load balancers key on.
///
/// # Example
///
/// ```
/// use skein_common::ServiceKey;
///
/// let key = ServiceKey::new("demo.Echo").with_group("blue").with_version("1.0");
/// assert_eq!(key.to_string(), "demo.Echo#blue#1.0");
/// assert_eq!("demo.Echo#blue#1.0".parse::<ServiceKey>().unwrap(), key);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub interface: String,
    pub group: String,
    pub version: String,
}

impl ServiceKey {
    /// Creates a key with an empty group and version.
    pub fn new(interface: impl Into<String>) -> Self {
        ServiceKey {
            interface: interface.into(),
            group: String::new(),
            version: String::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Checks that no segment contains a path or key separator.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Config` when the interface is empty or a segment
    /// contains `/` or `#`.
    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(RpcError::Config("service interface name is empty".to_string()));
        }
        for segment in [&self.interface, &self.group, &self.version] {
            if segment.contains('/') || segment.contains(KEY_SEPARATOR) {
                return Err(RpcError::Config(format!(
                    "invalid service key segment '{}'",
                    segment
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}",
            self.interface,
            self.group,
            self.version,
            sep = KEY_SEPARATOR
        )
    }
}

impl FromStr for ServiceKey {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(KEY_SEPARATOR);
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(interface), Some(group), Some(version), None) if !interface.is_empty() => {
                Ok(ServiceKey {
                    interface: interface.to_string(),
                    group: group.to_string(),
                    version: version.to_string(),
                })
            }
            _ => Err(RpcError::Config(format!("invalid service key '{}'", s))),
        }
    }
}

/// Network address of a service provider (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServiceAddress {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServiceAddress {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RpcError::Config(format!("address '{}' is missing a port", s)))?;
        if host.is_empty() {
            return Err(RpcError::Config(format!("address '{}' is missing a host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| RpcError::Config(format!("invalid port in '{}': {}", s, e)))?;
        Ok(ServiceAddress::new(host, port))
    }
}

impl From<std::net::SocketAddr> for ServiceAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        ServiceAddress::new(addr.ip().to_string(), addr.port())
    }
}
