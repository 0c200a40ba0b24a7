pub mod client;
pub mod pending;
pub mod pool;
pub mod proxy;

pub use client::{ClientConfig, RpcClient};
pub use pending::{PendingRequests, PendingResponse};
pub use pool::{Connection, ConnectionPool, PoolConfig};
pub use proxy::ServiceProxy;
