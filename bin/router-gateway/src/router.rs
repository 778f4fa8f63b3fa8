//! Ingress request handling: management endpoints, then proxy dispatch

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use router_api::HealthStatus;
use router_proxy::{
    HttpProxy, MetricsCollector, MiddlewareChain, MiddlewareContext, ProxyError, RemoteRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Registry snapshot that must have been refreshed within `max_age`
/// for the gateway to report itself healthy
pub struct Freshness {
    pub registry: Arc<RemoteRegistry>,
    pub max_age: Duration,
}

/// Router for ingress requests
pub struct Router {
    proxy: Arc<HttpProxy>,
    middleware: Arc<MiddlewareChain>,
    metrics: Arc<MetricsCollector>,
    freshness: Option<Freshness>,
}

impl Router {
    pub fn new(
        proxy: Arc<HttpProxy>,
        middleware: Arc<MiddlewareChain>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            proxy,
            middleware,
            metrics,
            freshness: None,
        }
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = Some(freshness);
        self
    }

    /// Hyper entry point: buffer the body and answer the request
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        let response = self.route(Request::from_parts(parts, body)).await;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, Full::new(body)))
    }

    pub async fn route(&self, req: Request<Bytes>) -> Response<Bytes> {
        let context = MiddlewareContext::from_request(&req);
        self.middleware.on_request(&context).await;

        // Management endpoints shadow routes with the same path
        let management = if *req.method() == Method::GET {
            match req.uri().path() {
                "/health" => Some(self.health()),
                "/metrics" => Some(self.metrics()),
                "/gateway/routes" => Some(self.routes()),
                _ => None,
            }
        } else {
            None
        };

        let response = match management {
            Some(response) => response,
            None => match self.proxy.try_dispatch(req).await {
                Ok(response) => response,
                Err(e) => {
                    self.middleware.on_error(&context, &e).await;
                    e.into_response()
                }
            },
        };

        self.middleware
            .on_response(&context, response.status().as_u16())
            .await;
        response
    }

    fn health(&self) -> Response<Bytes> {
        let fresh = self
            .freshness
            .as_ref()
            .map_or(true, |f| f.registry.is_fresh(f.max_age));
        if fresh {
            json(StatusCode::OK, &HealthStatus::up())
        } else {
            json(StatusCode::SERVICE_UNAVAILABLE, &HealthStatus::down())
        }
    }

    fn metrics(&self) -> Response<Bytes> {
        match self.metrics.gather() {
            Ok(text) => {
                let mut response = Response::new(Bytes::from(text));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                warn!("Failed to gather metrics: {}", e);
                let mut response = Response::new(Bytes::from_static(b"Failed to gather metrics\n"));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }

    fn routes(&self) -> Response<Bytes> {
        json(StatusCode::OK, &self.proxy.routes().definitions())
    }
}

fn json<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Bytes> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Bytes::from(body));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => ProxyError::InvalidRequest(format!("encoding response: {}", e)).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use router_api::{
        FilterDefinition, PredicateDefinition, RegistrationRequest, RetryDefinition,
        RouteDefinition, ServiceInstance,
    };
    use router_core::{LeaseConfig, ServiceRegistry};
    use router_proxy::{
        CircuitBreakerConfig, ForwardError, LoggingMiddleware, MetricsMiddleware, RegistryClient,
        RouteTable, Upstream,
    };

    /// Echoes the instance and path it was called with
    struct EchoUpstream;

    #[async_trait]
    impl Upstream for EchoUpstream {
        async fn send(
            &self,
            instance: &ServiceInstance,
            request: Request<Bytes>,
        ) -> Result<Response<Bytes>, ForwardError> {
            Ok(Response::new(Bytes::from(format!(
                "{} {}",
                instance.instance_id,
                request.uri().path()
            ))))
        }
    }

    fn routes() -> RouteTable {
        RouteTable::from_definitions(
            &[
                RouteDefinition {
                    id: "user-service".into(),
                    target: "lb://user".into(),
                    order: 0,
                    predicate: PredicateDefinition::Pattern("/user/**".into()),
                    methods: Vec::new(),
                    filters: vec![FilterDefinition::StripPrefix { parts: 1 }],
                    retry: None,
                },
                RouteDefinition {
                    id: "deploy-service".into(),
                    target: "lb://deploy".into(),
                    order: 0,
                    predicate: PredicateDefinition::Pattern("/deploy/**".into()),
                    methods: Vec::new(),
                    filters: vec![FilterDefinition::StripPrefix { parts: 1 }],
                    retry: None,
                },
            ],
            &RetryDefinition::default(),
        )
        .unwrap()
    }

    fn router() -> (Router, Arc<MetricsCollector>) {
        let registry = Arc::new(ServiceRegistry::new(LeaseConfig::default()));
        registry
            .register(RegistrationRequest::new("user", "user-1", "127.0.0.1", 8083))
            .unwrap();
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let proxy = HttpProxy::new(
            Arc::new(routes()),
            registry,
            Arc::new(EchoUpstream),
            CircuitBreakerConfig::default(),
        )
        .with_metrics(metrics.clone());
        let middleware = MiddlewareChain::new()
            .add(LoggingMiddleware)
            .add(MetricsMiddleware::new(metrics.clone()));
        (
            Router::new(Arc::new(proxy), Arc::new(middleware), metrics.clone()),
            metrics,
        )
    }

    fn get(uri: &str) -> Request<Bytes> {
        Request::builder().uri(uri).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn test_health_up() {
        let (router, _) = router();
        let response = router.route(get("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), br#"{"status":"UP"}"#);
    }

    #[tokio::test]
    async fn test_health_down_when_snapshot_stale() {
        let (router, _) = router();
        let client = RegistryClient::new("http://127.0.0.1:1", Duration::from_millis(100)).unwrap();
        let router = router.with_freshness(Freshness {
            registry: Arc::new(RemoteRegistry::new(client)),
            max_age: Duration::from_secs(15),
        });
        let response = router.route(get("/health")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body().as_ref(), br#"{"status":"DOWN"}"#);
    }

    #[tokio::test]
    async fn test_dispatch_through_router() {
        let (router, metrics) = router();
        let response = router.route(get("/user/profile")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"user-1 /profile");

        let unavailable = router.route(get("/deploy/status")).await;
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let missing = router.route(get("/other")).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let text = metrics.gather().unwrap();
        assert!(text.contains("gateway_requests_total{method=\"GET\",status=\"200\"} 1"));
        assert!(text.contains("gateway_errors_total{kind=\"service_unavailable\"} 1"));
        assert!(text.contains("gateway_errors_total{kind=\"route_not_found\"} 1"));
    }

    #[tokio::test]
    async fn test_routes_endpoint() {
        let (router, _) = router();
        let response = router.route(get("/gateway/routes")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let routes: Vec<RouteDefinition> = serde_json::from_slice(response.body()).unwrap();
        let ids: Vec<&str> = routes.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["user-service", "deploy-service"]);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (router, _) = router();
        router.route(get("/user/a")).await;
        let response = router.route(get("/metrics")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(text.contains("gateway_route_requests_total"));
    }
}
