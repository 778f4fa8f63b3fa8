//! Process configuration for the gateway and the registry
//!
//! Both processes read a YAML file (path from `ROUTER_CONFIG`) once at startup.
//! A missing file yields the defaults; selected fields can be overridden from
//! the environment.

use crate::route::{LoadBalancingPolicy, RetryDefinition, RouteDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway process configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Ingress listen address
    pub listen: String,
    /// Base URL of the registry process
    pub registry_url: String,
    /// How often the registry snapshot is pulled
    pub refresh_interval_secs: u64,
    /// Upper bound for one forwarded call
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub load_balancing: LoadBalancingPolicy,
    pub circuit_breaker: CircuitBreakerSettings,
    /// Retry policy for routes that do not declare one
    pub default_retry: RetryDefinition,
    /// Register the gateway itself in the registry
    pub self_registration: Option<SelfRegistration>,
    pub routes: Vec<RouteDefinition>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            registry_url: "http://127.0.0.1:8761".to_string(),
            refresh_interval_secs: 5,
            request_timeout_ms: 5000,
            connect_timeout_ms: 1000,
            load_balancing: LoadBalancingPolicy::RoundRobin,
            circuit_breaker: CircuitBreakerSettings::default(),
            default_retry: RetryDefinition::default(),
            self_registration: None,
            routes: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_yaml_str(&read_file(path)?),
            None => Ok(Self::default()),
        }
    }

    /// Apply `ROUTER_LISTEN` and `ROUTER_REGISTRY_URL` style overrides
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("ROUTER_LISTEN") {
            self.listen = listen;
        }
        if let Some(url) = lookup("ROUTER_REGISTRY_URL") {
            self.registry_url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid("refresh_interval_secs must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("request_timeout_ms must be positive".into()));
        }
        if let Some(registration) = &self.self_registration {
            registration.validate()?;
        }
        self.circuit_breaker.validate()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Circuit breaker thresholds, applied per target service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures within `window_secs` that open the circuit
    pub failure_threshold: u32,
    pub window_secs: u64,
    /// Time the circuit stays open before a trial call is admitted
    pub wait_duration_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_secs: 60,
            wait_duration_secs: 30,
        }
    }
}

impl CircuitBreakerSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Invalid("failure_threshold must be positive".into()));
        }
        if self.window_secs == 0 {
            return Err(ConfigError::Invalid("circuit window_secs must be positive".into()));
        }
        Ok(())
    }
}

/// How the gateway announces itself to the registry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelfRegistration {
    #[serde(default = "default_gateway_service_id")]
    pub service_id: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

impl SelfRegistration {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "self_registration.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.instance_id.trim().is_empty() || self.host.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "self_registration needs an instance_id and a host".into(),
            ));
        }
        Ok(())
    }
}

/// Registry process configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub listen: String,
    /// Time an instance stays registered without a heartbeat
    pub lease_duration_secs: u64,
    /// Period of the eviction sweep
    pub eviction_interval_secs: u64,
    pub self_preservation: bool,
    /// Share of instances expected to renew; a sweep that would evict more
    /// than the remainder is suspended when self-preservation is on
    pub renewal_percent_threshold: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8761".to_string(),
            lease_duration_secs: 90,
            eviction_interval_secs: 30,
            self_preservation: false,
            renewal_percent_threshold: 0.85,
        }
    }
}

impl RegistryConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_yaml_str(&read_file(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("ROUTER_LISTEN") {
            self.listen = listen;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_duration_secs == 0 {
            return Err(ConfigError::Invalid("lease_duration_secs must be positive".into()));
        }
        if self.eviction_interval_secs == 0 {
            return Err(ConfigError::Invalid("eviction_interval_secs must be positive".into()));
        }
        if !(self.renewal_percent_threshold > 0.0 && self.renewal_percent_threshold <= 1.0) {
            return Err(ConfigError::Invalid(
                "renewal_percent_threshold must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn default_gateway_service_id() -> String {
    "gateway".to_string()
}

fn default_heartbeat_interval() -> u64 {
    30
}
