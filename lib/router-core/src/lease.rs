//! Lease expiry and the periodic eviction sweep

use crate::ServiceRegistry;
use router_api::RegistryConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lease configuration
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseConfig {
    /// Time an instance stays live without renewing
    pub lease_duration: Duration,
    /// Interval between eviction sweeps
    pub eviction_interval: Duration,
    /// Suspend eviction when too many leases expire at once
    pub self_preservation: bool,
    /// Share of instances expected to keep renewing
    pub renewal_percent_threshold: f64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(90),
            eviction_interval: Duration::from_secs(30),
            self_preservation: false,
            renewal_percent_threshold: 0.85,
        }
    }
}

impl From<&RegistryConfig> for LeaseConfig {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            lease_duration: config.lease_duration(),
            eviction_interval: config.eviction_interval(),
            self_preservation: config.self_preservation,
            renewal_percent_threshold: config.renewal_percent_threshold,
        }
    }
}

impl LeaseConfig {
    /// Whether a sweep that finds `expired` of `total` leases expired must be skipped.
    ///
    /// Losing more than `1 - renewal_percent_threshold` of the fleet in one
    /// sweep looks like a partition between the registry and its clients
    /// rather than real departures.
    pub fn suppresses_eviction(&self, expired: usize, total: usize) -> bool {
        if !self.self_preservation || total == 0 {
            return false;
        }
        let allowed = 1.0 - self.renewal_percent_threshold;
        (expired as f64 / total as f64) > allowed
    }
}

/// Outcome of one eviction sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Leases found expired
    pub expired: usize,
    /// Leases removed
    pub evicted: usize,
    /// Eviction skipped by self-preservation
    pub suppressed: bool,
}

/// Runs the eviction sweep on a fixed interval
pub struct LeaseManager {
    registry: Arc<ServiceRegistry>,
    interval: Duration,
}

impl LeaseManager {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        let interval = registry.config().eviction_interval;
        Self { registry, interval }
    }

    /// Spawn the sweep loop; it stops when `shutdown` is cancelled
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Lease manager started (interval: {:?}, lease: {:?}, self-preservation: {})",
            self.interval,
            self.registry.config().lease_duration,
            self.registry.config().self_preservation
        );

        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Lease manager stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.registry.evict_expired();
                    debug!(
                        expired = report.expired,
                        evicted = report.evicted,
                        suppressed = report.suppressed,
                        "Eviction sweep finished"
                    );
                }
            }
        }
    }
}
