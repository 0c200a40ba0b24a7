use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use skein_common::extension::{Extension, ExtensionLoader};
use skein_common::{Result, RpcError, ServiceAddress, ServiceKey};
use tracing::debug;

use crate::recorder::ActiveRequestRecorder;

/// Chooses one provider address for a call.
pub trait LoadBalancer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Selects one of `candidates` for a call to `service`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NoAvailableAddress` when `candidates` is empty.
    fn select(&self, service: &ServiceKey, candidates: &[ServiceAddress]) -> Result<ServiceAddress> {
        match candidates {
            [] => Err(RpcError::NoAvailableAddress(service.to_string())),
            [only] => Ok(only.clone()),
            _ => Ok(self.do_select(service, candidates)),
        }
    }

    /// Strategy hook, called with at least two candidates.
    fn do_select(&self, service: &ServiceKey, candidates: &[ServiceAddress]) -> ServiceAddress;
}

impl Extension for dyn LoadBalancer {
    const CAPABILITY: &'static str = "load-balancer";
    const DEFAULT_CONFIG: &'static str = "\
roundRobin=skein_balance::RoundRobinBalancer
leastActive=skein_balance::LeastActiveBalancer
";
}

/// Registers both strategies in a loader's catalog.
///
/// The least-active factory shares `recorder` with the client that brackets
/// calls with it.
pub fn register_builtin_balancers(
    loader: &ExtensionLoader<dyn LoadBalancer>,
    recorder: Arc<ActiveRequestRecorder>,
) {
    loader.register("skein_balance::RoundRobinBalancer", || Arc::new(RoundRobinBalancer::new()));
    loader.register("skein_balance::LeastActiveBalancer", move || {
        Arc::new(LeastActiveBalancer::new(recorder.clone()))
    });
}

/// Per-service-key position counters.
#[derive(Debug)]
struct Sequences {
    positions: DashMap<ServiceKey, AtomicUsize>,
    reset_above: usize,
}

impl Sequences {
    fn new() -> Self {
        Self::with_reset_above(usize::MAX / 2)
    }

    fn with_reset_above(reset_above: usize) -> Self {
        Sequences {
            positions: DashMap::new(),
            reset_above,
        }
    }

    /// Returns the current position for `service` and advances it.
    fn next(&self, service: &ServiceKey) -> usize {
        if let Some(position) = self.positions.get(service) {
            return self.advance(&position);
        }
        let position = self
            .positions
            .entry(service.clone())
            .or_insert_with(|| AtomicUsize::new(0));
        self.advance(&position)
    }

    fn advance(&self, position: &AtomicUsize) -> usize {
        let current = position.fetch_add(1, Ordering::Relaxed);
        if current >= self.reset_above {
            position.store(0, Ordering::Relaxed);
        }
        current
    }
}

/// Cycles through the candidates, one counter per service key.
///
/// The index is taken modulo the current candidate count on every call, so
/// the rotation adapts when providers come and go.
#[derive(Debug)]
pub struct RoundRobinBalancer {
    sequences: Sequences,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        RoundRobinBalancer {
            sequences: Sequences::new(),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "roundRobin"
    }

    fn do_select(&self, service: &ServiceKey, candidates: &[ServiceAddress]) -> ServiceAddress {
        let index = self.sequences.next(service) % candidates.len();
        candidates[index].clone()
    }
}

/// Prefers the addresses with the fewest in-flight requests.
///
/// Ties are broken round-robin over the tied subset, with a counter per
/// service key.
#[derive(Debug)]
pub struct LeastActiveBalancer {
    recorder: Arc<ActiveRequestRecorder>,
    sequences: Sequences,
}

impl LeastActiveBalancer {
    pub fn new(recorder: Arc<ActiveRequestRecorder>) -> Self {
        LeastActiveBalancer {
            recorder,
            sequences: Sequences::new(),
        }
    }
}

impl LoadBalancer for LeastActiveBalancer {
    fn name(&self) -> &'static str {
        "leastActive"
    }

    fn do_select(&self, service: &ServiceKey, candidates: &[ServiceAddress]) -> ServiceAddress {
        let mut least = u64::MAX;
        let mut tied: Vec<&ServiceAddress> = Vec::with_capacity(candidates.len());
        for addr in candidates {
            let active = self.recorder.active_count(service, addr);
            if active < least {
                least = active;
                tied.clear();
                tied.push(addr);
            } else if active == least {
                tied.push(addr);
            }
        }

        let chosen = match tied.as_slice() {
            [only] => *only,
            _ => tied[self.sequences.next(service) % tied.len()],
        };
        debug!(service = %service, addr = %chosen, active = least, tied = tied.len(), "Least active selection");
        chosen.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str) -> ServiceKey {
        ServiceKey::new(name)
    }

    fn addrs(n: u16) -> Vec<ServiceAddress> {
        (0..n).map(|i| ServiceAddress::new("10.0.0.1", 9000 + i)).collect()
    }

    #[test]
    fn test_empty_candidates_fail() {
        let lb = RoundRobinBalancer::new();
        assert!(matches!(
            lb.select(&svc("Svc"), &[]),
            Err(RpcError::NoAvailableAddress(_))
        ));

        let lb = LeastActiveBalancer::new(Arc::new(ActiveRequestRecorder::new()));
        assert!(matches!(
            lb.select(&svc("Svc"), &[]),
            Err(RpcError::NoAvailableAddress(_))
        ));
    }

    #[test]
    fn test_single_candidate_returned_directly() {
        let lb = RoundRobinBalancer::new();
        let only = addrs(1);
        for _ in 0..3 {
            assert_eq!(lb.select(&svc("Svc"), &only).unwrap(), only[0]);
        }
    }

    #[test]
    fn test_round_robin_visits_each_twice_in_order() {
        let lb = RoundRobinBalancer::new();
        let candidates = addrs(4);
        let picks: Vec<_> = (0..8)
            .map(|_| lb.select(&svc("Svc"), &candidates).unwrap())
            .collect();

        let expected: Vec<_> = candidates.iter().chain(candidates.iter()).cloned().collect();
        assert_eq!(picks, expected);
    }

    #[test]
    fn test_round_robin_counters_are_per_service() {
        let lb = RoundRobinBalancer::new();
        let candidates = addrs(3);
        assert_eq!(lb.select(&svc("A"), &candidates).unwrap(), candidates[0]);
        assert_eq!(lb.select(&svc("A"), &candidates).unwrap(), candidates[1]);
        assert_eq!(lb.select(&svc("B"), &candidates).unwrap(), candidates[0]);
    }

    #[test]
    fn test_round_robin_adapts_to_shrinking_candidates() {
        let lb = RoundRobinBalancer::new();
        let three = addrs(3);
        lb.select(&svc("Svc"), &three).unwrap();
        lb.select(&svc("Svc"), &three).unwrap();

        // position 2 against two candidates wraps to the first
        let two = addrs(2);
        assert_eq!(lb.select(&svc("Svc"), &two).unwrap(), two[0]);
    }

    #[test]
    fn test_sequence_resets_past_threshold() {
        let sequences = Sequences::with_reset_above(3);
        let key = svc("Svc");
        let taken: Vec<_> = (0..6).map(|_| sequences.next(&key)).collect();
        assert_eq!(taken, vec![0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_least_active_prefers_idle() {
        let recorder = Arc::new(ActiveRequestRecorder::new());
        let lb = LeastActiveBalancer::new(recorder.clone());
        let candidates = addrs(3);
        let key = svc("Svc");

        recorder.increment(&key, &candidates[0]);
        recorder.increment(&key, &candidates[1]);

        for _ in 0..5 {
            assert_eq!(lb.select(&key, &candidates).unwrap(), candidates[2]);
        }
    }

    #[test]
    fn test_least_active_alternates_between_ties() {
        let recorder = Arc::new(ActiveRequestRecorder::new());
        let lb = LeastActiveBalancer::new(recorder.clone());
        let candidates = addrs(3);
        let key = svc("Svc");

        for _ in 0..3 {
            recorder.increment(&key, &candidates[0]);
        }
        recorder.increment(&key, &candidates[1]);
        recorder.increment(&key, &candidates[2]);

        let first = lb.select(&key, &candidates).unwrap();
        let second = lb.select(&key, &candidates).unwrap();
        let third = lb.select(&key, &candidates).unwrap();

        assert_ne!(first, candidates[0]);
        assert_ne!(second, candidates[0]);
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn test_builtin_registration() {
        let recorder = Arc::new(ActiveRequestRecorder::new());
        let loader: ExtensionLoader<dyn LoadBalancer> = ExtensionLoader::new(None);
        register_builtin_balancers(&loader, recorder);

        assert_eq!(loader.get("roundRobin").unwrap().name(), "roundRobin");
        assert_eq!(loader.get("leastActive").unwrap().name(), "leastActive");
        assert!(matches!(
            loader.get("random"),
            Err(RpcError::ExtensionNotFound { .. })
        ));
    }
}
