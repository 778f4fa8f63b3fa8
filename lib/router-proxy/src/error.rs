//! Gateway error taxonomy and its HTTP mapping

use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use std::time::Duration;
use thiserror::Error;

/// Header set on fast-fail responses so clients can tell an open circuit
/// apart from a service with no instances
pub const CIRCUIT_BREAKER_HEADER: &str = "x-circuit-breaker";

/// Errors raised while dispatching a request; each maps to one HTTP response
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("No available instance of service {0}")]
    ServiceUnavailable(String),

    #[error("Circuit breaker open for service {service_id}")]
    CircuitOpen {
        service_id: String,
        retry_after: Duration,
    },

    #[error("Service {service_id} did not respond within {timeout:?}")]
    UpstreamTimeout {
        service_id: String,
        timeout: Duration,
    },

    #[error("Error communicating with service {service_id}: {reason}")]
    UpstreamTransport { service_id: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ProxyError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamTransport { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Short label used in metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::RouteNotFound { .. } => "route_not_found",
            ProxyError::ServiceUnavailable(_) => "service_unavailable",
            ProxyError::CircuitOpen { .. } => "circuit_open",
            ProxyError::UpstreamTimeout { .. } => "timeout",
            ProxyError::UpstreamTransport { .. } => "transport",
            ProxyError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Plain-text error response returned to the client
    pub fn into_response(&self) -> Response<Bytes> {
        let status = self.status();
        let reason = status.canonical_reason().unwrap_or("Error");
        let mut response = Response::new(Bytes::from(format!("{}: {}\n", reason, self)));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

        if let ProxyError::CircuitOpen { retry_after, .. } = self {
            response
                .headers_mut()
                .insert(CIRCUIT_BREAKER_HEADER, HeaderValue::from_static("open"));
            // Round up so clients never retry before the wait has elapsed
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

/// Invalid route configuration, reported at startup
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteConfigError {
    #[error("Duplicate route id: {0}")]
    DuplicateId(String),

    #[error("Route {0} has an empty target service")]
    EmptyTarget(String),

    #[error("Route {route}: invalid path predicate {predicate:?}")]
    InvalidPredicate { route: String, predicate: String },

    #[error("Route {route}: invalid method {method:?}")]
    InvalidMethod { route: String, method: String },

    #[error("Route {route}: invalid filter: {reason}")]
    InvalidFilter { route: String, reason: String },
}
