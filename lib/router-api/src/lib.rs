//! Shared wire and configuration types for the registry and the gateway
//!
//! This library defines:
//! - ServiceInstance: a registered instance as returned by the Registry API
//! - RegistrationRequest / StatusUpdate: Registry API request bodies
//! - RouteDefinition: declarative gateway routes and filters
//! - GatewayConfig / RegistryConfig: process configuration loaded at startup

pub mod config;
pub mod instance;
pub mod route;

pub use config::{
    CircuitBreakerSettings, ConfigError, GatewayConfig, RegistryConfig, SelfRegistration,
};
pub use instance::{
    normalize_service_id, HealthState, HealthStatus, InstanceStatus, RegistrationRequest,
    ServiceInstance, StatusUpdate,
};
pub use route::{
    FilterDefinition, LoadBalancingPolicy, PredicateDefinition, RetryDefinition, RouteDefinition,
};
