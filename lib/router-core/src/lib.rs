//! Core service registry functionality
//!
//! This library provides:
//! - Service registry holding leased service instances
//! - Lease manager running the periodic eviction sweep
//! - Self-preservation against mass expiry during network partitions

pub mod error;
pub mod lease;
pub mod registry;

pub use error::{CoreError, Result};
pub use lease::{EvictionReport, LeaseConfig, LeaseManager};
pub use registry::{RegistryStats, ServiceRegistry};
