use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use router_api::GatewayConfig;
use router_proxy::{
    CircuitBreakerConfig, HttpProxy, LoggingMiddleware, MetricsCollector, MetricsMiddleware,
    MiddlewareChain, RegistryClient, RemoteRegistry, RequestForwarder, RouteTable, SelfRegistrar,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod router;

use router::{Freshness, Router};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting router-gateway...");

    let config_path = std::env::var_os("ROUTER_CONFIG").map(PathBuf::from);
    let mut config = GatewayConfig::load(config_path.as_deref())
        .context("Failed to load gateway configuration")?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;

    let routes = Arc::new(
        RouteTable::from_definitions(&config.routes, &config.default_retry)
            .context("Invalid route configuration")?,
    );
    if routes.is_empty() {
        warn!("No routes configured (see config/gateway.yaml); every request will be answered with 404");
    }
    info!("Route table initialized with {} routes", routes.len());

    let shutdown = CancellationToken::new();

    let client = RegistryClient::new(&config.registry_url, config.request_timeout())
        .context("Failed to create registry client")?;
    let remote = Arc::new(RemoteRegistry::new(client.clone()));
    if let Err(e) = remote.refresh().await {
        warn!("Initial registry fetch from {} failed: {}", config.registry_url, e);
    }
    let refresh_task = remote
        .clone()
        .spawn_refresh(config.refresh_interval(), shutdown.clone());
    info!(
        "Polling registry at {} every {:?}",
        config.registry_url,
        config.refresh_interval()
    );

    let forwarder = Arc::new(RequestForwarder::new(
        config.request_timeout(),
        config.connect_timeout(),
    ));
    info!(
        "Request forwarder initialized with {:?} timeout",
        config.request_timeout()
    );

    let metrics = Arc::new(MetricsCollector::new().context("Failed to create metrics collector")?);

    let proxy = Arc::new(
        HttpProxy::new(
            routes,
            remote.clone(),
            forwarder,
            CircuitBreakerConfig::from(&config.circuit_breaker),
        )
        .with_load_balancing(config.load_balancing)
        .with_metrics(metrics.clone()),
    );

    let middleware = Arc::new(
        MiddlewareChain::new()
            .add(LoggingMiddleware)
            .add(MetricsMiddleware::new(metrics.clone())),
    );

    let router = Arc::new(
        Router::new(proxy, middleware, metrics).with_freshness(Freshness {
            registry: remote,
            max_age: config.refresh_interval() * 3,
        }),
    );

    let registrar_task = config.self_registration.as_ref().map(|settings| {
        info!(
            "Registering gateway as {}/{}",
            settings.service_id, settings.instance_id
        );
        SelfRegistrar::new(client.clone(), settings).spawn(shutdown.clone())
    });

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen))?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let graceful = GracefulShutdown::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Error accepting connection: {}", e);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let router = router.clone();
                let service = service_fn(move |req| {
                    let router = router.clone();
                    async move { router.handle(req).await }
                });
                let conn = graceful.watch(http1::Builder::new().serve_connection(io, service));
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
                    }
                });
            }
            _ = &mut ctrl_c => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    shutdown.cancel();
    drop(listener);
    tokio::select! {
        _ = graceful.shutdown() => info!("All connections closed"),
        _ = tokio::time::sleep(Duration::from_secs(10)) => warn!("Timed out waiting for connections to close"),
    }
    refresh_task.await?;
    if let Some(task) = registrar_task {
        task.await?;
    }
    info!("router-gateway stopped");
    Ok(())
}

/// `RUST_LOG` filter (default `info`); `ROUTER_LOG_FORMAT=json` for JSON lines
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ROUTER_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
