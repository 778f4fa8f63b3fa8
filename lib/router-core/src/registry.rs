//! Service registry holding leased service instances
//!
//! Writers are serialised per service id; readers load an immutable snapshot
//! of the service's instance map and never take a lock. A mutation (or an
//! eviction sweep) swaps in a new map, so a concurrent reader observes either
//! the old or the new map in full.

use crate::lease::{EvictionReport, LeaseConfig};
use crate::{CoreError, Result};
use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use router_api::{normalize_service_id, InstanceStatus, RegistrationRequest, ServiceInstance};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A registered instance together with its monotonic renewal time
#[derive(Clone, Debug)]
struct Lease {
    instance: ServiceInstance,
    renewed_at: Instant,
}

impl Lease {
    fn is_expired(&self, now: Instant, config: &LeaseConfig) -> bool {
        now.saturating_duration_since(self.renewed_at) > config.lease_duration
    }

    fn renew(&mut self, now: Instant) {
        self.renewed_at = now;
        self.instance.last_renewal_timestamp = Utc::now();
    }
}

type InstanceMap = HashMap<String, Lease>;

/// Per-service slot: a writer lock and the current instance map.
///
/// Slots are never unlinked once created, so a writer holding an `Arc` to a
/// slot can never update a map that readers no longer see.
struct ServiceEntry {
    write_lock: Mutex<()>,
    instances: ArcSwap<InstanceMap>,
}

impl ServiceEntry {
    fn new() -> Self {
        Self {
            write_lock: Mutex::new(()),
            instances: ArcSwap::from_pointee(InstanceMap::new()),
        }
    }

    /// Clone-modify-swap the instance map under the writer lock
    fn update<R>(&self, f: impl FnOnce(&mut InstanceMap) -> R) -> R {
        let _guard = self.write_lock.lock();
        let mut instances = InstanceMap::clone(&self.instances.load_full());
        let result = f(&mut instances);
        self.instances.store(Arc::new(instances));
        result
    }
}

#[derive(Default)]
struct Counters {
    registrations: AtomicU64,
    renewals: AtomicU64,
    cancellations: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time registry statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub services: usize,
    /// Leases held, including expired ones not yet swept
    pub instances: usize,
    pub registrations: u64,
    pub renewals: u64,
    pub cancellations: u64,
    pub evictions: u64,
    pub self_preservation_active: bool,
}

/// ServiceRegistry maintains the leased instances of every service
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceEntry>>,
    config: LeaseConfig,
    counters: Counters,
    self_preservation_active: AtomicBool,
}

impl ServiceRegistry {
    pub fn new(config: LeaseConfig) -> Self {
        Self {
            services: DashMap::new(),
            config,
            counters: Counters::default(),
            self_preservation_active: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Register or overwrite an instance; the lease starts now
    pub fn register(&self, request: RegistrationRequest) -> Result<ServiceInstance> {
        let service_id = normalize_service_id(&request.service_id);
        if service_id.is_empty() {
            return Err(CoreError::InvalidRegistration("service id is empty".into()));
        }
        if request.instance_id.trim().is_empty() {
            return Err(CoreError::InvalidRegistration("instance id is empty".into()));
        }
        if request.host.trim().is_empty() {
            return Err(CoreError::InvalidRegistration("host is empty".into()));
        }
        if request.port == 0 {
            return Err(CoreError::InvalidRegistration("port must be non-zero".into()));
        }

        let instance_id = request.instance_id.trim().to_string();
        let now = Instant::now();
        let wall_now = Utc::now();

        let instance = self.entry_or_insert(&service_id).update(|instances| {
            let registration_timestamp = instances
                .get(&instance_id)
                .map(|lease| lease.instance.registration_timestamp)
                .unwrap_or(wall_now);
            let instance = ServiceInstance {
                service_id: service_id.clone(),
                instance_id: instance_id.clone(),
                host: request.host.trim().to_string(),
                port: request.port,
                status: request.status,
                registration_timestamp,
                last_renewal_timestamp: wall_now,
            };
            instances.insert(
                instance_id.clone(),
                Lease {
                    instance: instance.clone(),
                    renewed_at: now,
                },
            );
            instance
        });

        self.counters.registrations.fetch_add(1, Ordering::Relaxed);
        info!(
            service_id = %instance.service_id,
            instance_id = %instance.instance_id,
            address = %instance.authority(),
            status = %instance.status,
            "Registered instance"
        );
        Ok(instance)
    }

    /// Renew the lease of an instance
    pub fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<()> {
        let service_id = normalize_service_id(service_id);
        let instance_id = instance_id.trim();
        let now = Instant::now();

        let renewed = self.existing(&service_id).is_some_and(|entry| {
            entry.update(|instances| match instances.get_mut(instance_id) {
                Some(lease) => {
                    lease.renew(now);
                    true
                }
                None => false,
            })
        });

        if !renewed {
            debug!(service_id = %service_id, instance_id, "Heartbeat for unknown instance");
            return Err(CoreError::instance_not_found(&service_id, instance_id));
        }
        self.counters.renewals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Change the status of an instance; also renews its lease
    pub fn set_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let service_id = normalize_service_id(service_id);
        let instance_id = instance_id.trim();
        let now = Instant::now();

        let updated = self.existing(&service_id).is_some_and(|entry| {
            entry.update(|instances| match instances.get_mut(instance_id) {
                Some(lease) => {
                    lease.instance.status = status;
                    lease.renew(now);
                    true
                }
                None => false,
            })
        });

        if !updated {
            return Err(CoreError::instance_not_found(&service_id, instance_id));
        }
        info!(service_id = %service_id, instance_id, status = %status, "Instance status changed");
        Ok(())
    }

    /// Remove an instance; returns whether it was registered
    pub fn deregister(&self, service_id: &str, instance_id: &str) -> bool {
        let service_id = normalize_service_id(service_id);
        let instance_id = instance_id.trim();
        let removed = self.existing(&service_id).is_some_and(|entry| {
            entry.update(|instances| instances.remove(instance_id).is_some())
        });

        if removed {
            self.counters.cancellations.fetch_add(1, Ordering::Relaxed);
            info!(service_id = %service_id, instance_id, "Deregistered instance");
        }
        removed
    }

    /// Live instances with status UP, ordered by instance id
    pub fn get_instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.live_instances(&normalize_service_id(service_id), true)
    }

    /// Live instances of any status, ordered by instance id
    pub fn get_all_instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.live_instances(&normalize_service_id(service_id), false)
    }

    /// Live UP instances of every service that has at least one
    pub fn snapshot(&self) -> BTreeMap<String, Vec<ServiceInstance>> {
        self.service_ids()
            .into_iter()
            .filter_map(|service_id| {
                let instances = self.live_instances(&service_id, true);
                (!instances.is_empty()).then_some((service_id, instances))
            })
            .collect()
    }

    /// Ids of all services currently holding leases
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .services
            .iter()
            .filter(|e| !e.value().instances.load().is_empty())
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> RegistryStats {
        let mut services = 0;
        let mut instances = 0;
        for entry in self.services.iter() {
            let held = entry.value().instances.load().len();
            if held > 0 {
                services += 1;
                instances += held;
            }
        }
        RegistryStats {
            services,
            instances,
            registrations: self.counters.registrations.load(Ordering::Relaxed),
            renewals: self.counters.renewals.load(Ordering::Relaxed),
            cancellations: self.counters.cancellations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            self_preservation_active: self.self_preservation_active.load(Ordering::Relaxed),
        }
    }

    pub fn self_preservation_active(&self) -> bool {
        self.self_preservation_active.load(Ordering::Relaxed)
    }

    /// Run one eviction sweep
    pub fn evict_expired(&self) -> EvictionReport {
        let now = Instant::now();

        let mut total = 0usize;
        let mut candidates: Vec<(String, Vec<String>)> = Vec::new();
        for entry in self.services.iter() {
            let instances = entry.value().instances.load();
            total += instances.len();
            let expired: Vec<String> = instances
                .iter()
                .filter(|(_, lease)| lease.is_expired(now, &self.config))
                .map(|(id, _)| id.clone())
                .collect();
            if !expired.is_empty() {
                candidates.push((entry.key().clone(), expired));
            }
        }

        let expired: usize = candidates.iter().map(|(_, ids)| ids.len()).sum();
        if expired == 0 {
            self.self_preservation_active.store(false, Ordering::Relaxed);
            return EvictionReport::default();
        }

        if self.config.suppresses_eviction(expired, total) {
            if !self.self_preservation_active.swap(true, Ordering::Relaxed) {
                warn!(
                    expired,
                    total,
                    "Self-preservation engaged: too many leases expired at once, eviction suspended"
                );
            }
            return EvictionReport {
                expired,
                evicted: 0,
                suppressed: true,
            };
        }
        if self.self_preservation_active.swap(false, Ordering::Relaxed) {
            info!("Self-preservation released");
        }

        let mut evicted = 0usize;
        for (service_id, ids) in candidates {
            // Leases renewed since the scan are kept
            let Some(entry) = self.existing(&service_id) else {
                continue;
            };
            let removed = entry.update(|instances| {
                let mut removed = 0usize;
                for id in &ids {
                    if instances.get(id).is_some_and(|l| l.is_expired(now, &self.config)) {
                        instances.remove(id);
                        removed += 1;
                    }
                }
                removed
            });
            if removed > 0 {
                warn!(service_id = %service_id, removed, "Evicted expired instances");
            }
            evicted += removed;
        }

        self.counters.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        EvictionReport {
            expired,
            evicted,
            suppressed: false,
        }
    }

    fn live_instances(&self, service_id: &str, up_only: bool) -> Vec<ServiceInstance> {
        let Some(entry) = self.existing(service_id) else {
            return Vec::new();
        };
        let now = Instant::now();
        let snapshot = entry.instances.load();
        let mut instances: Vec<ServiceInstance> = snapshot
            .values()
            .filter(|lease| !lease.is_expired(now, &self.config))
            .filter(|lease| !up_only || lease.instance.is_up())
            .map(|lease| lease.instance.clone())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances
    }

    fn existing(&self, service_id: &str) -> Option<Arc<ServiceEntry>> {
        self.services.get(service_id).map(|e| Arc::clone(e.value()))
    }

    fn entry_or_insert(&self, service_id: &str) -> Arc<ServiceEntry> {
        Arc::clone(
            self.services
                .entry(service_id.to_string())
                .or_insert_with(|| Arc::new(ServiceEntry::new()))
                .value(),
        )
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(LeaseConfig::default())
    }
}
