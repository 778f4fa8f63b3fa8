//! Prometheus metrics for the registry, sampled from registry statistics at scrape time

use parking_lot::Mutex;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use router_core::RegistryStats;

pub struct RegistryMetrics {
    registrations: IntCounter,
    renewals: IntCounter,
    cancellations: IntCounter,
    evictions: IntCounter,
    services: IntGauge,
    instances: IntGauge,
    self_preservation: IntGauge,
    registry: Registry,
    // Serialises scrapes so counter deltas are applied once
    scrape: Mutex<()>,
}

impl RegistryMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let registrations =
            IntCounter::new("registry_registrations_total", "Instance registrations")?;
        let renewals = IntCounter::new("registry_renewals_total", "Lease renewals (heartbeats)")?;
        let cancellations =
            IntCounter::new("registry_cancellations_total", "Explicit deregistrations")?;
        let evictions = IntCounter::new("registry_evictions_total", "Leases evicted on expiry")?;
        let services = IntGauge::new("registry_services", "Services holding at least one lease")?;
        let instances = IntGauge::new("registry_instances", "Leases currently held")?;
        let self_preservation = IntGauge::new(
            "registry_self_preservation_active",
            "1 while eviction is suspended by self-preservation",
        )?;

        registry.register(Box::new(registrations.clone()))?;
        registry.register(Box::new(renewals.clone()))?;
        registry.register(Box::new(cancellations.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(services.clone()))?;
        registry.register(Box::new(instances.clone()))?;
        registry.register(Box::new(self_preservation.clone()))?;

        Ok(Self {
            registrations,
            renewals,
            cancellations,
            evictions,
            services,
            instances,
            self_preservation,
            registry,
            scrape: Mutex::new(()),
        })
    }

    /// Bring the exported values up to date with `stats` and encode them
    pub fn render(&self, stats: &RegistryStats) -> Result<String, prometheus::Error> {
        {
            let _guard = self.scrape.lock();
            advance(&self.registrations, stats.registrations);
            advance(&self.renewals, stats.renewals);
            advance(&self.cancellations, stats.cancellations);
            advance(&self.evictions, stats.evictions);
            self.services.set(stats.services as i64);
            self.instances.set(stats.instances as i64);
            self.self_preservation
                .set(i64::from(stats.self_preservation_active));
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn advance(counter: &IntCounter, total: u64) {
    let delta = total.saturating_sub(counter.get());
    if delta > 0 {
        counter.inc_by(delta);
    }
}
