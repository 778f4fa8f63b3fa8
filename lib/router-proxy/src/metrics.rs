//! Prometheus metrics for the gateway

use crate::error::ProxyError;
use crate::middleware::{Middleware, MiddlewareContext};
use crate::policy::CircuitState;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::debug;

/// Prometheus metrics collector for gateway traffic
#[derive(Clone)]
pub struct MetricsCollector {
    /// Requests by method and final status
    pub requests_total: CounterVec,
    /// End-to-end latency by method
    pub request_duration_seconds: HistogramVec,
    /// Requests that ended in a gateway error, by error kind
    pub errors_total: CounterVec,
    /// Requests matched per route, by final status
    pub route_requests_total: CounterVec,
    /// Failed upstream attempts by service and failure kind
    pub upstream_failures_total: CounterVec,
    /// Retry attempts by service
    pub retries_total: CounterVec,
    /// 0 closed, 1 open, 2 half-open
    pub circuit_state: IntGaugeVec,
    /// Calls rejected by an open circuit
    pub circuit_rejections_total: CounterVec,
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let requests_total = CounterVec::new(
            Opts::new("gateway_requests_total", "Total requests handled by the gateway"),
            &["method", "status"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_request_duration_seconds",
                "Gateway request latency in seconds",
            ),
            &["method"],
        )?;
        let errors_total = CounterVec::new(
            Opts::new("gateway_errors_total", "Requests answered with a gateway error"),
            &["kind"],
        )?;
        let route_requests_total = CounterVec::new(
            Opts::new("gateway_route_requests_total", "Requests dispatched per route"),
            &["route", "status"],
        )?;
        let upstream_failures_total = CounterVec::new(
            Opts::new(
                "gateway_upstream_failures_total",
                "Failed calls to service instances",
            ),
            &["service", "kind"],
        )?;
        let retries_total = CounterVec::new(
            Opts::new("gateway_retries_total", "Retried calls to service instances"),
            &["service"],
        )?;
        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "gateway_circuit_state",
                "Circuit breaker state per service (0 closed, 1 open, 2 half-open)",
            ),
            &["service"],
        )?;
        let circuit_rejections_total = CounterVec::new(
            Opts::new(
                "gateway_circuit_rejections_total",
                "Calls rejected by an open circuit breaker",
            ),
            &["service"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(route_requests_total.clone()))?;
        registry.register(Box::new(upstream_failures_total.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(circuit_rejections_total.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            errors_total,
            route_requests_total,
            upstream_failures_total,
            retries_total,
            circuit_state,
            circuit_rejections_total,
            registry,
        })
    }

    pub fn record_circuit_state(&self, service_id: &str, state: CircuitState) {
        self.circuit_state
            .with_label_values(&[service_id])
            .set(state.gauge_value());
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Records request counts and latency for every ingress request
pub struct MetricsMiddleware {
    pub collector: Arc<MetricsCollector>,
}

impl MetricsMiddleware {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) {
        debug!(
            "Recording response metrics for {} {} -> {}",
            context.method, context.path, status
        );
        let method = method_label(&context.method);
        self.collector
            .requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
        self.collector
            .request_duration_seconds
            .with_label_values(&[method])
            .observe(context.elapsed().as_secs_f64());
    }

    async fn on_error(&self, _context: &MiddlewareContext, error: &ProxyError) {
        self.collector
            .errors_total
            .with_label_values(&[error.kind()])
            .inc();
    }
}

/// Extension methods share one label value to bound series cardinality
fn method_label(method: &str) -> &str {
    match method {
        "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "PATCH" | "OPTIONS" | "CONNECT"
        | "TRACE" => method,
        _ => "OTHER",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Bytes;
    use hyper::Request;

    fn context() -> MiddlewareContext {
        context_for("GET")
    }

    fn context_for(method: &str) -> MiddlewareContext {
        let request = Request::builder()
            .method(method)
            .uri("/user/profile")
            .body(Bytes::new())
            .unwrap();
        MiddlewareContext::from_request(&request)
    }

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().expect("Failed to create collector");
        assert!(collector.gather().is_ok());
    }

    #[test]
    fn test_metrics_text_format_structure() {
        let collector = MetricsCollector::new().unwrap();
        collector
            .retries_total
            .with_label_values(&["user"])
            .inc();
        collector.record_circuit_state("user", CircuitState::Open);

        let metrics = collector.gather().unwrap();
        assert!(metrics.contains("# HELP"));
        assert!(metrics.contains("# TYPE"));
        assert!(metrics.contains("gateway_retries_total{service=\"user\"} 1"));
        assert!(metrics.contains("gateway_circuit_state{service=\"user\"} 1"));
    }

    #[test]
    fn test_metrics_collector_clone_shares_registry() {
        let collector1 = MetricsCollector::new().unwrap();
        let collector2 = collector1.clone();
        collector1
            .circuit_rejections_total
            .with_label_values(&["deploy"])
            .inc();
        assert!(collector2
            .gather()
            .unwrap()
            .contains("gateway_circuit_rejections_total{service=\"deploy\"} 1"));
    }

    #[tokio::test]
    async fn test_metrics_middleware_on_response() {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        let middleware = MetricsMiddleware::new(collector.clone());
        assert_eq!(middleware.name(), "MetricsMiddleware");

        middleware.on_response(&context(), 200).await;
        middleware.on_response(&context(), 200).await;

        let metrics = collector.gather().unwrap();
        assert!(metrics.contains("gateway_requests_total{method=\"GET\",status=\"200\"} 2"));
        assert!(metrics.contains("gateway_request_duration_seconds_count{method=\"GET\"} 2"));
    }

    #[tokio::test]
    async fn test_extension_methods_share_one_label() {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        let middleware = MetricsMiddleware::new(collector.clone());

        middleware.on_response(&context_for("PURGE"), 404).await;
        middleware.on_response(&context_for("X-RANDOM-1"), 404).await;
        middleware.on_response(&context_for("DELETE"), 204).await;

        let metrics = collector.gather().unwrap();
        assert!(metrics.contains("gateway_requests_total{method=\"OTHER\",status=\"404\"} 2"));
        assert!(metrics.contains("gateway_requests_total{method=\"DELETE\",status=\"204\"} 1"));
        assert!(!metrics.contains("PURGE"));
    }

    #[tokio::test]
    async fn test_metrics_middleware_on_error() {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        let middleware = MetricsMiddleware::new(collector.clone());

        middleware
            .on_error(&context(), &ProxyError::ServiceUnavailable("deploy".into()))
            .await;

        let metrics = collector.gather().unwrap();
        assert!(metrics.contains("gateway_errors_total{kind=\"service_unavailable\"} 1"));
    }
}
