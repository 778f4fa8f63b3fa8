//! End-to-end dispatch against real HTTP backends on ephemeral ports

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use router_api::{
    FilterDefinition, PredicateDefinition, RegistrationRequest, RetryDefinition, RouteDefinition,
};
use router_core::{LeaseConfig, ServiceRegistry};
use router_proxy::{CircuitBreakerConfig, HttpProxy, RequestForwarder, RouteTable};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Requests seen by a backend: path and query plus the `x-gateway-source` header
type Seen = Arc<Mutex<Vec<(String, Option<String>)>>>;

async fn spawn_backend(name: &'static str, delay: Duration) -> (SocketAddr, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let log = log.clone();
                    async move {
                        let path = req
                            .uri()
                            .path_and_query()
                            .map(|pq| pq.to_string())
                            .unwrap_or_default();
                        let source = req
                            .headers()
                            .get("x-gateway-source")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        log.lock().push((path.clone(), source));
                        tokio::time::sleep(delay).await;
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("server", name)
                                .body(Full::new(Bytes::from(format!("{} {}", name, path))))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, seen)
}

/// Answers `POST` with 201 and echoes the body it received
async fn spawn_creating_backend() -> (SocketAddr, Arc<Mutex<Vec<(String, Bytes)>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let log = log.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let log = log.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await?.to_bytes();
                        log.lock().push((format!("{} {}", parts.method, parts.uri.path()), body.clone()));
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .status(StatusCode::CREATED)
                                .header("content-type", "application/json")
                                .body(Full::new(body))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, seen)
}

fn route(id: &str, target: &str, order: i32, pattern: &str, filters: Vec<FilterDefinition>) -> RouteDefinition {
    RouteDefinition {
        id: id.to_string(),
        target: format!("lb://{}", target),
        order,
        predicate: PredicateDefinition::Pattern(pattern.to_string()),
        methods: Vec::new(),
        filters,
        retry: None,
    }
}

fn gateway(registry: Arc<ServiceRegistry>, timeout: Duration) -> HttpProxy {
    let strip = || FilterDefinition::StripPrefix { parts: 1 };
    let table = RouteTable::from_definitions(
        &[
            route("default-route", "fe", 1000, "/**", Vec::new()),
            route(
                "user-service",
                "user",
                0,
                "/user/**",
                vec![
                    strip(),
                    FilterDefinition::AddRequestHeader {
                        name: "X-Gateway-Source".into(),
                        value: "edge-gateway".into(),
                    },
                    FilterDefinition::AddResponseHeader {
                        name: "X-Gateway-Route".into(),
                        value: "user-service".into(),
                    },
                    FilterDefinition::AddResponseTimestamp {
                        name: "X-Gateway-Timestamp".into(),
                    },
                ],
            ),
            route("deploy-service", "deploy", 0, "/deploy/**", vec![strip()]),
            route("fe-service", "fe", 0, "/fe/**", vec![strip()]),
        ],
        &RetryDefinition {
            initial_backoff_ms: 10,
            jitter_ms: 0,
            ..RetryDefinition::default()
        },
    )
    .unwrap();

    HttpProxy::new(
        Arc::new(table),
        registry,
        Arc::new(RequestForwarder::new(timeout, Duration::from_millis(500))),
        CircuitBreakerConfig::default(),
    )
}

fn register(registry: &ServiceRegistry, service: &str, instance: &str, addr: SocketAddr) {
    registry
        .register(RegistrationRequest::new(service, instance, "127.0.0.1", addr.port()))
        .unwrap();
}

fn get(uri: &str) -> Request<Bytes> {
    Request::builder()
        .uri(uri)
        .header("host", "gateway.local")
        .body(Bytes::new())
        .unwrap()
}

async fn unused_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_user_route_strips_prefix_and_decorates() {
    let (addr, seen) = spawn_backend("user", Duration::ZERO).await;
    let registry = Arc::new(ServiceRegistry::new(LeaseConfig::default()));
    register(&registry, "user", "user-1", addr);
    let proxy = gateway(registry, Duration::from_secs(2));

    let response = proxy.dispatch(get("/user/profile?id=7")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"user /profile?id=7");
    assert_eq!(response.headers()["x-gateway-route"], "user-service");
    assert!(response.headers().contains_key("x-gateway-timestamp"));
    assert_eq!(response.headers()["server"], "user");
    assert_eq!(
        *seen.lock(),
        vec![("/profile?id=7".to_string(), Some("edge-gateway".to_string()))]
    );
}

#[tokio::test]
async fn test_service_without_instances_is_503() {
    let registry = Arc::new(ServiceRegistry::new(LeaseConfig::default()));
    let proxy = gateway(registry, Duration::from_secs(2));

    let response = proxy.dispatch(get("/deploy/status")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_catch_all_reaches_frontend() {
    let (addr, seen) = spawn_backend("fe", Duration::ZERO).await;
    let registry = Arc::new(ServiceRegistry::new(LeaseConfig::default()));
    register(&registry, "fe", "fe-1", addr);
    let proxy = gateway(registry, Duration::from_secs(2));

    let response = proxy.dispatch(get("/xyz")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body().as_ref(), b"fe /xyz");

    let response = proxy.dispatch(get("/fe/index.html")).await;
    assert_eq!(response.body().as_ref(), b"fe /index.html");
    assert_eq!(seen.lock().len(), 2);
}

#[tokio::test]
async fn test_dead_instance_is_retried_elsewhere() {
    let dead = unused_port().await;
    let (alive, seen) = spawn_backend("user", Duration::ZERO).await;
    let registry = Arc::new(ServiceRegistry::new(LeaseConfig::default()));
    // Round-robin starts at the lowest instance id
    register(&registry, "user", "user-1", dead);
    register(&registry, "user", "user-2", alive);
    let proxy = gateway(registry, Duration::from_secs(2));

    let response = proxy.dispatch(get("/user/a")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(seen.lock().len(), 1);
}

#[tokio::test]
async fn test_deregistered_instance_no_longer_receives_traffic() {
    let (first, first_seen) = spawn_backend("user-a", Duration::ZERO).await;
    let (second, second_seen) = spawn_backend("user-b", Duration::ZERO).await;
    let registry = Arc::new(ServiceRegistry::new(LeaseConfig::default()));
    register(&registry, "user", "user-1", first);
    register(&registry, "user", "user-2", second);
    let proxy = gateway(registry.clone(), Duration::from_secs(2));

    registry.deregister("user", "user-1");
    for _ in 0..4 {
        assert_eq!(proxy.dispatch(get("/user/x")).await.status(), StatusCode::OK);
    }
    assert!(first_seen.lock().is_empty());
    assert_eq!(second_seen.lock().len(), 4);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let (addr, _) = spawn_backend("user", Duration::from_secs(5)).await;
    let registry = Arc::new(ServiceRegistry::new(LeaseConfig::default()));
    register(&registry, "user", "user-1", addr);
    let proxy = gateway(registry, Duration::from_millis(200));

    let response = proxy.dispatch(get("/user/slow")).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn test_post_body_forwarded_and_created_status_kept() {
    let (addr, seen) = spawn_creating_backend().await;
    let registry = Arc::new(ServiceRegistry::new(LeaseConfig::default()));
    register(&registry, "deploy", "deploy-1", addr);
    let proxy = gateway(registry, Duration::from_secs(2));

    let body = Bytes::from_static(br#"{"name":"new-deployment"}"#);
    let request = Request::builder()
        .method("POST")
        .uri("/deploy/deployments")
        .header("content-type", "application/json")
        .body(body.clone())
        .unwrap();
    let response = proxy.dispatch(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["content-type"], "application/json");
    assert_eq!(response.body(), &body);
    assert_eq!(*seen.lock(), vec![("POST /deployments".to_string(), body)]);
}
