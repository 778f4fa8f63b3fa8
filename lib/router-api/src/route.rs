//! Declarative gateway route definitions
//!
//! Routes are loaded once at startup from the gateway configuration file, e.g.
//!
//! ```yaml
//! routes:
//!   - id: user-service
//!     target: user
//!     order: 0
//!     predicate:
//!       pattern: /user/**
//!     filters:
//!       - kind: strip-prefix
//!         parts: 1
//!       - kind: add-request-header
//!         name: X-Gateway-Source
//!         value: edge-gateway
//! ```

use serde::{Deserialize, Serialize};

/// A single routing rule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Unique route id
    pub id: String,

    /// Target logical service (a leading `lb://` is accepted and ignored)
    pub target: String,

    /// Lower values are evaluated first
    #[serde(default)]
    pub order: i32,

    /// Path predicate, written as a single-key map (`pattern: /user/**`)
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub predicate: PredicateDefinition,

    /// HTTP methods this route accepts (empty means any)
    #[serde(default)]
    pub methods: Vec<String>,

    /// Filters applied in declared order
    #[serde(default)]
    pub filters: Vec<FilterDefinition>,

    /// Retry policy, gateway default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryDefinition>,
}

/// Path matching rule
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PredicateDefinition {
    /// Segment-aware prefix, e.g. `/api` matches `/api` and `/api/x` but not `/apix`
    Prefix(String),
    /// Ant-style pattern: `*` matches one segment, `**` any number of segments
    Pattern(String),
}

/// Filter applied to the forwarded request or the returned response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum FilterDefinition {
    StripPrefix { parts: usize },
    PrefixPath { prefix: String },
    AddRequestHeader { name: String, value: String },
    RemoveRequestHeader { name: String },
    AddResponseHeader { name: String, value: String },
    RemoveResponseHeader { name: String },
    /// Adds the time the gateway received the request (RFC 3339)
    AddResponseTimestamp { name: String },
    SetStatus { status: u16 },
}

/// Retry behaviour for a route
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryDefinition {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Methods that may be retried; non-idempotent methods only when listed here
    #[serde(default = "default_retry_methods")]
    pub methods: Vec<String>,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Upper bound of the random delay added to each backoff
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
}

impl Default for RetryDefinition {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            methods: default_retry_methods(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter_ms: default_jitter(),
        }
    }
}

/// Load balancing policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingPolicy {
    /// Round-robin cursor per service
    RoundRobin,
    /// Uniform random choice
    Random,
}

impl Default for LoadBalancingPolicy {
    fn default() -> Self {
        LoadBalancingPolicy::RoundRobin
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

fn default_initial_backoff() -> u64 {
    50
}

fn default_max_backoff() -> u64 {
    2000
}

fn default_jitter() -> u64 {
    25
}
