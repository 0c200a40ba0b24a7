//! In-flight request accounting per (service, address).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use skein_common::{ServiceAddress, ServiceKey};
use tracing::trace;

/// Counts in-flight requests per service key and provider address.
///
/// Storage is two-level (service key → address → count). Each update runs
/// under the service key's shard lock, so increments and decrements of one
/// pair never interleave, while unrelated service keys proceed in parallel.
/// Entries are pruned bottom-up when their count reaches zero.
#[derive(Debug, Default)]
pub struct ActiveRequestRecorder {
    services: DashMap<ServiceKey, HashMap<ServiceAddress, u64>>,
}

impl ActiveRequestRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, service: &ServiceKey, addr: &ServiceAddress) {
        let mut addresses = self.services.entry(service.clone()).or_default();
        let count = addresses.entry(addr.clone()).or_insert(0);
        *count += 1;
        trace!(service = %service, addr = %addr, active = *count, "Active request recorded");
    }

    /// Decrements the pair's count; a no-op for unknown pairs.
    pub fn decrement(&self, service: &ServiceKey, addr: &ServiceAddress) {
        let service_empty = {
            let Some(mut addresses) = self.services.get_mut(service) else {
                return;
            };
            if let Some(count) = addresses.get_mut(addr) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    addresses.remove(addr);
                }
            }
            addresses.is_empty()
        };

        if service_empty {
            self.services.remove_if(service, |_, addresses| addresses.is_empty());
        }
    }

    /// Current in-flight count for the pair, zero if never seen.
    pub fn active_count(&self, service: &ServiceKey, addr: &ServiceAddress) -> u64 {
        self.services
            .get(service)
            .and_then(|addresses| addresses.get(addr).copied())
            .unwrap_or(0)
    }

    /// Number of service keys with at least one in-flight request.
    pub fn tracked_services(&self) -> usize {
        self.services.len()
    }

    /// Increments now and decrements when the returned guard drops.
    pub fn track(self: &Arc<Self>, service: &ServiceKey, addr: &ServiceAddress) -> ActiveGuard {
        ActiveGuard::new(self.clone(), service.clone(), addr.clone())
    }
}

/// Holds one in-flight slot in an [`ActiveRequestRecorder`].
///
/// The decrement runs on drop, so it also happens when the calling future
/// is cancelled.
#[must_use = "the request is counted as finished as soon as the guard drops"]
pub struct ActiveGuard {
    recorder: Arc<ActiveRequestRecorder>,
    service: ServiceKey,
    addr: ServiceAddress,
}

impl ActiveGuard {
    pub fn new(recorder: Arc<ActiveRequestRecorder>, service: ServiceKey, addr: ServiceAddress) -> Self {
        recorder.increment(&service, &addr);
        ActiveGuard {
            recorder,
            service,
            addr,
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.recorder.decrement(&self.service, &self.addr);
    }
}
