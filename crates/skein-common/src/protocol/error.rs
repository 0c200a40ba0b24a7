use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Extension not found: no '{name}' registered for capability '{capability}'")]
    ExtensionNotFound { capability: String, name: String },

    #[error("No available address for service {0}")]
    NoAvailableAddress(String),

    #[error("Request {request_id} timed out after {timeout_ms}ms")]
    RpcTimeout { request_id: String, timeout_ms: u64 },

    #[error("Connect to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },

    #[error("Connection to {0} closed")]
    ConnectionClosed(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Coordination service unavailable: {0}")]
    CoordinatorUnavailable(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Remote call failed with code {code}: {message}")]
    Remote { code: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
