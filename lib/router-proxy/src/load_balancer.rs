//! Load balancing strategies for distributing traffic across service instances

use dashmap::DashMap;
use rand::Rng;
use router_api::{LoadBalancingPolicy, ServiceInstance};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Load balancer for selecting instances based on a policy
#[derive(Debug, Default)]
pub struct LoadBalancer {
    policy: LoadBalancingPolicy,
    /// Round-robin cursor per service
    cursors: DashMap<String, AtomicUsize>,
}

impl LoadBalancer {
    /// Create a new load balancer with the specified policy
    pub fn new(policy: LoadBalancingPolicy) -> Self {
        Self {
            policy,
            cursors: DashMap::new(),
        }
    }

    pub fn policy(&self) -> LoadBalancingPolicy {
        self.policy
    }

    /// Select an UP instance of `service_id`.
    ///
    /// Instances whose ids are in `exclude` (already tried by this request)
    /// are skipped unless nothing else is left.
    pub fn select<'a>(
        &self,
        service_id: &str,
        instances: &'a [ServiceInstance],
        exclude: &[String],
    ) -> Option<&'a ServiceInstance> {
        let up: Vec<&'a ServiceInstance> = instances.iter().filter(|i| i.is_up()).collect();
        if up.is_empty() {
            return None;
        }

        let fresh: Vec<&'a ServiceInstance> = up
            .iter()
            .copied()
            .filter(|i| !exclude.contains(&i.instance_id))
            .collect();
        let candidates = if fresh.is_empty() { up } else { fresh };

        let index = match self.policy {
            LoadBalancingPolicy::RoundRobin => self.next_cursor(service_id) % candidates.len(),
            LoadBalancingPolicy::Random => rand::thread_rng().gen_range(0..candidates.len()),
        };
        candidates.get(index).copied()
    }

    fn next_cursor(&self, service_id: &str) -> usize {
        if let Some(cursor) = self.cursors.get(service_id) {
            return cursor.fetch_add(1, Ordering::Relaxed);
        }
        self.cursors
            .entry(service_id.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}
