//! Service instance types exchanged over the Registry API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status reported by a service instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    /// Ready to receive traffic
    Up,
    /// Alive but unhealthy
    Down,
    /// Registered, still booting
    Starting,
    /// Taken out of rotation by an operator
    OutOfService,
}

impl Default for InstanceStatus {
    fn default() -> Self {
        InstanceStatus::Up
    }
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "STARTING" => Ok(InstanceStatus::Starting),
            "OUT_OF_SERVICE" => Ok(InstanceStatus::OutOfService),
            other => Err(format!("unknown instance status: {}", other)),
        }
    }
}

/// A registered service instance
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    /// Logical service name, always lowercase
    pub service_id: String,
    /// Unique id of this process within the service
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    pub registration_timestamp: DateTime<Utc>,
    pub last_renewal_timestamp: DateTime<Utc>,
}

impl ServiceInstance {
    /// `host:port` authority used to reach this instance
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.status == InstanceStatus::Up
    }
}

/// Body of `PUT /registry/{serviceId}/{instanceId}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    /// Filled from the request path by the server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_id: String,
    /// Filled from the request path by the server
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl RegistrationRequest {
    pub fn new(
        service_id: impl Into<String>,
        instance_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            instance_id: instance_id.into(),
            host: host.into(),
            port,
            status: InstanceStatus::Up,
        }
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }
}

/// Body of `PUT /registry/{serviceId}/{instanceId}/status`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: InstanceStatus,
}

/// Health state reported on `/health`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthState {
    Up,
    Down,
}

/// Body of `GET /health`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
}

impl HealthStatus {
    pub fn up() -> Self {
        Self { status: HealthState::Up }
    }

    pub fn down() -> Self {
        Self { status: HealthState::Down }
    }
}

/// Service ids are case-insensitive; every component compares them lowercased.
pub fn normalize_service_id(service_id: &str) -> String {
    service_id.trim().to_ascii_lowercase()
}
