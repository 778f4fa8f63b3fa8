//! HTTP proxy: resolves a route, picks an instance and forwards the request

use crate::discovery::InstanceSource;
use crate::error::ProxyError;
use crate::filter::{apply_request_filters, apply_response_filters, FilterContext};
use crate::forwarder::{ForwardError, Upstream};
use crate::load_balancer::LoadBalancer;
use crate::metrics::MetricsCollector;
use crate::policy::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};
use crate::route_table::{Route, RouteTable};
use chrono::Utc;
use hyper::body::Bytes;
use hyper::{Request, Response};
use router_api::LoadBalancingPolicy;
use std::sync::Arc;
use tracing::{debug, warn};

/// HTTP proxy for forwarding requests to registered services
pub struct HttpProxy {
    routes: Arc<RouteTable>,
    instances: Arc<dyn InstanceSource>,
    upstream: Arc<dyn Upstream>,
    balancer: LoadBalancer,
    breakers: CircuitBreakerRegistry,
    metrics: Option<Arc<MetricsCollector>>,
}

impl HttpProxy {
    pub fn new(
        routes: Arc<RouteTable>,
        instances: Arc<dyn InstanceSource>,
        upstream: Arc<dyn Upstream>,
        circuit_breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            routes,
            instances,
            upstream,
            balancer: LoadBalancer::new(LoadBalancingPolicy::RoundRobin),
            breakers: CircuitBreakerRegistry::new(circuit_breaker),
            metrics: None,
        }
    }

    pub fn with_load_balancing(mut self, policy: LoadBalancingPolicy) -> Self {
        self.balancer = LoadBalancer::new(policy);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Dispatch a request, turning every error into its HTTP response
    pub async fn dispatch(&self, request: Request<Bytes>) -> Response<Bytes> {
        match self.try_dispatch(request).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    pub async fn try_dispatch(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let context = FilterContext::new(Utc::now());
        let route = self
            .routes
            .resolve_request(request.method(), request.uri().path())
            .ok_or_else(|| ProxyError::RouteNotFound {
                method: request.method().to_string(),
                path: request.uri().path().to_string(),
            })?;

        let result = self.dispatch_route(&route, request, &context).await;

        if let Some(metrics) = &self.metrics {
            let status = match &result {
                Ok(response) => response.status(),
                Err(e) => e.status(),
            };
            metrics
                .route_requests_total
                .with_label_values(&[&route.id, status.as_str()])
                .inc();
        }
        result
    }

    async fn dispatch_route(
        &self,
        route: &Route,
        mut request: Request<Bytes>,
        context: &FilterContext,
    ) -> Result<Response<Bytes>, ProxyError> {
        let service_id = route.target_service_id.as_str();
        apply_request_filters(&route.filters, &mut request, context)?;

        let max_attempts = if route.retry.allows_method(request.method()) {
            route.retry.max_retries.saturating_add(1)
        } else {
            1
        };
        let breaker = self.breakers.get(service_id);
        let mut tried: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            let instances = self.instances.instances(service_id);
            let instance = self
                .balancer
                .select(service_id, &instances, &tried)
                .ok_or_else(|| ProxyError::ServiceUnavailable(service_id.to_string()))?;

            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(open) => {
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .circuit_rejections_total
                            .with_label_values(&[service_id])
                            .inc();
                    }
                    self.record_state(service_id, &breaker);
                    return Err(ProxyError::CircuitOpen {
                        service_id: service_id.to_string(),
                        retry_after: open.retry_after,
                    });
                }
            };
            self.record_state(service_id, &breaker);

            debug!(
                "Dispatching {} {} to {}/{} (attempt {})",
                request.method(),
                request.uri(),
                service_id,
                instance.instance_id,
                attempt + 1
            );
            let outcome = self.upstream.send(instance, clone_request(&request)).await;
            attempt += 1;

            let failed: Result<Response<Bytes>, ProxyError> = match outcome {
                Ok(response) if !RetryPolicy::is_retryable_status(response.status()) => {
                    permit.success();
                    self.record_state(service_id, &breaker);
                    let mut response = response;
                    apply_response_filters(&route.filters, &mut response, context);
                    return Ok(response);
                }
                Ok(response) => {
                    permit.failure();
                    self.record_failure(service_id, response.status().as_str());
                    Ok(response)
                }
                Err(ForwardError::Timeout(timeout)) => {
                    permit.failure();
                    self.record_failure(service_id, "timeout");
                    Err(ProxyError::UpstreamTimeout {
                        service_id: service_id.to_string(),
                        timeout,
                    })
                }
                Err(e) => {
                    permit.failure();
                    self.record_failure(service_id, "transport");
                    Err(ProxyError::UpstreamTransport {
                        service_id: service_id.to_string(),
                        reason: e.to_string(),
                    })
                }
            };
            self.record_state(service_id, &breaker);
            tried.push(instance.instance_id.clone());

            if attempt >= max_attempts {
                warn!(
                    "Giving up on {} {} after {} attempt(s) to {}",
                    request.method(),
                    request.uri(),
                    attempt,
                    service_id
                );
                return failed.map(|mut response| {
                    apply_response_filters(&route.filters, &mut response, context);
                    response
                });
            }

            if let Some(metrics) = &self.metrics {
                metrics.retries_total.with_label_values(&[service_id]).inc();
            }
            let backoff = route.retry.backoff_with_jitter(attempt - 1);
            debug!("Retrying {} in {:?}", service_id, backoff);
            tokio::time::sleep(backoff).await;
        }
    }

    fn record_failure(&self, service_id: &str, kind: &str) {
        if let Some(metrics) = &self.metrics {
            metrics
                .upstream_failures_total
                .with_label_values(&[service_id, kind])
                .inc();
        }
    }

    fn record_state(&self, service_id: &str, breaker: &CircuitBreaker) {
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_state(service_id, breaker.state());
        }
    }
}

/// Copy of a buffered request for one forwarding attempt
fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut copy = Request::new(request.body().clone());
    *copy.method_mut() = request.method().clone();
    *copy.uri_mut() = request.uri().clone();
    *copy.version_mut() = request.version();
    *copy.headers_mut() = request.headers().clone();
    copy
}
