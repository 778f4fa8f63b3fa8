use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use router_api::RegistryConfig;
use router_core::{LeaseConfig, LeaseManager, ServiceRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod metrics;

use api::ApiState;
use metrics::RegistryMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting service-discovery...");

    let config_path = std::env::var_os("ROUTER_CONFIG").map(PathBuf::from);
    let mut config = RegistryConfig::load(config_path.as_deref())
        .context("Failed to load registry configuration")?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;

    let registry = Arc::new(ServiceRegistry::new(LeaseConfig::from(&config)));
    info!(
        "Service registry initialized (lease: {:?}, eviction interval: {:?})",
        config.lease_duration(),
        config.eviction_interval()
    );

    let shutdown = CancellationToken::new();
    let lease_task = LeaseManager::new(registry.clone()).spawn(shutdown.clone());

    let state = Arc::new(ApiState {
        registry,
        metrics: RegistryMetrics::new().context("Failed to create metrics")?,
    });

    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen))?;
    let listener = TcpListener::bind(addr).await?;
    info!("Registry API listening on {}", addr);

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
                let state = state.clone();
                let service = service_fn(move |req| api::handle_request(req, state.clone()));
                let conn = graceful.watch(http1::Builder::new().serve_connection(io, service));
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("Error serving connection from {}: {}", peer_addr, e);
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
    lease_task.await?;
    info!("service-discovery stopped");
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
