//! Calls that were sent and are waiting for their response.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use skein_common::{RequestId, Result, RpcError, RpcResponse};
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct PendingEntry {
    connection_id: u64,
    tx: oneshot::Sender<Result<RpcResponse>>,
}

/// Maps request ids to the callers waiting on them.
///
/// The connection reader completes entries as responses arrive. Each entry
/// remembers which connection carried its request, so closing a connection
/// fails exactly the calls that were in flight on it.
#[derive(Default)]
pub struct PendingRequests {
    entries: DashMap<RequestId, PendingEntry>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call sent on `connection_id`.
    ///
    /// The returned future resolves with the response. Dropping it removes
    /// the entry, so a timed-out or cancelled call leaves nothing behind.
    pub fn register(self: &Arc<Self>, request_id: RequestId, connection_id: u64) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.entries
            .insert(request_id.clone(), PendingEntry { connection_id, tx });
        PendingResponse {
            table: self.clone(),
            request_id,
            rx,
        }
    }

    /// Hands `response` to the waiting caller.
    ///
    /// Returns `false` (and logs) when no call is waiting for that id, e.g.
    /// because it already timed out.
    pub fn complete(&self, response: RpcResponse) -> bool {
        match self.entries.remove(&response.request_id) {
            Some((_, entry)) => {
                let request_id = response.request_id.clone();
                if entry.tx.send(Ok(response)).is_err() {
                    debug!(request_id = %request_id, "Caller gone before response arrived");
                }
                true
            }
            None => {
                warn!(request_id = %response.request_id, "Response for unknown request");
                false
            }
        }
    }

    /// Removes an entry without completing it.
    pub fn remove(&self, request_id: &str) -> bool {
        self.entries.remove(request_id).is_some()
    }

    /// Fails every call in flight on `connection_id` with `ConnectionClosed`.
    ///
    /// Returns how many calls were failed.
    pub fn fail_connection(&self, connection_id: u64, peer: &str) -> usize {
        let orphaned: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect();

        let mut failed = 0;
        for request_id in orphaned {
            if let Some((_, entry)) = self.entries.remove(&request_id) {
                let _ = entry.tx.send(Err(RpcError::ConnectionClosed(peer.to_string())));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves with the response to one registered call.
pub struct PendingResponse {
    table: Arc<PendingRequests>,
    request_id: RequestId,
    rx: oneshot::Receiver<Result<RpcResponse>>,
}

impl PendingResponse {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for PendingResponse {
    type Output = Result<RpcResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(RpcError::Connection("response channel dropped".to_string())))
        })
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.table.entries.remove(&self.request_id);
    }
}
