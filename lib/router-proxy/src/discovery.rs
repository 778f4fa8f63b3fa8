//! Instance discovery for the gateway
//!
//! [`InstanceSource`] is the seam between the dispatcher and the registry.
//! In-process deployments hand the dispatcher a [`ServiceRegistry`]
//! directly; the gateway process uses a [`RemoteRegistry`] that polls the
//! Registry API and serves lookups from its latest snapshot.

use arc_swap::ArcSwap;
use router_api::{
    normalize_service_id, InstanceStatus, RegistrationRequest, SelfRegistration,
    ServiceInstance, StatusUpdate,
};
use router_core::ServiceRegistry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Supplies the current instances of a service
pub trait InstanceSource: Send + Sync {
    /// Live instances of `service_id`; may be empty
    fn instances(&self, service_id: &str) -> Vec<ServiceInstance>;
}

impl InstanceSource for ServiceRegistry {
    fn instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.get_instances(service_id)
    }
}

/// Errors from the Registry API client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("instance {service_id}/{instance_id} is not registered")]
    NotRegistered {
        service_id: String,
        instance_id: String,
    },

    #[error("registry returned unexpected status {0}")]
    UnexpectedStatus(u16),
}

/// Client for the Registry API
#[derive(Clone, Debug)]
pub struct RegistryClient {
    base_url: String,
    client: reqwest::Client,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn instance_url(&self, service_id: &str, instance_id: &str) -> String {
        format!(
            "{}/registry/{}/{}",
            self.base_url,
            normalize_service_id(service_id),
            instance_id
        )
    }

    pub async fn register(&self, request: &RegistrationRequest) -> Result<(), ClientError> {
        let response = self
            .client
            .put(self.instance_url(&request.service_id, &request.instance_id))
            .json(request)
            .send()
            .await?;
        expect_success(response.status())
    }

    /// Renew a lease; [`ClientError::NotRegistered`] when the registry has
    /// no record of the instance
    pub async fn heartbeat(&self, service_id: &str, instance_id: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .put(self.instance_url(service_id, instance_id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotRegistered {
                service_id: service_id.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        expect_success(response.status())
    }

    pub async fn set_status(
        &self,
        service_id: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), ClientError> {
        let url = format!("{}/status", self.instance_url(service_id, instance_id));
        let response = self
            .client
            .put(url)
            .json(&StatusUpdate { status })
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotRegistered {
                service_id: service_id.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
        expect_success(response.status())
    }

    pub async fn deregister(&self, service_id: &str, instance_id: &str) -> Result<(), ClientError> {
        let response = self
            .client
            .delete(self.instance_url(service_id, instance_id))
            .send()
            .await?;
        expect_success(response.status())
    }

    /// Live UP instances of every service
    pub async fn fetch_all(&self) -> Result<BTreeMap<String, Vec<ServiceInstance>>, ClientError> {
        let response = self
            .client
            .get(format!("{}/registry", self.base_url))
            .send()
            .await?;
        expect_success(response.status())?;
        Ok(response.json().await?)
    }

    pub async fn fetch_service(&self, service_id: &str) -> Result<Vec<ServiceInstance>, ClientError> {
        let response = self
            .client
            .get(format!(
                "{}/registry/{}",
                self.base_url,
                normalize_service_id(service_id)
            ))
            .send()
            .await?;
        expect_success(response.status())?;
        Ok(response.json().await?)
    }
}

fn expect_success(status: reqwest::StatusCode) -> Result<(), ClientError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ClientError::UnexpectedStatus(status.as_u16()))
    }
}

struct Snapshot {
    services: BTreeMap<String, Vec<ServiceInstance>>,
    fetched_at: Option<Instant>,
}

/// Registry view kept fresh by polling the Registry API
pub struct RemoteRegistry {
    client: RegistryClient,
    snapshot: ArcSwap<Snapshot>,
}

impl RemoteRegistry {
    pub fn new(client: RegistryClient) -> Self {
        Self {
            client,
            snapshot: ArcSwap::from_pointee(Snapshot {
                services: BTreeMap::new(),
                fetched_at: None,
            }),
        }
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    /// Fetch a new snapshot; on failure the previous one is kept
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let services = self.client.fetch_all().await?;
        let instances: usize = services.values().map(Vec::len).sum();
        debug!(
            "Registry snapshot refreshed: {} services, {} instances",
            services.len(),
            instances
        );
        self.snapshot.store(Arc::new(Snapshot {
            services,
            fetched_at: Some(Instant::now()),
        }));
        Ok(())
    }

    /// Whether the last successful refresh happened within `max_age`
    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.snapshot
            .load()
            .fetched_at
            .map(|at| at.elapsed() <= max_age)
            .unwrap_or(false)
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.snapshot.load().services.keys().cloned().collect()
    }

    /// Refresh now and then every `interval` until `shutdown` fires
    pub fn spawn_refresh(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Registry refresh stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            warn!("Registry refresh failed, keeping last snapshot: {}", e);
                        }
                    }
                }
            }
        })
    }
}

impl InstanceSource for RemoteRegistry {
    fn instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.snapshot
            .load()
            .services
            .get(&normalize_service_id(service_id))
            .cloned()
            .unwrap_or_default()
    }
}

/// Keeps the gateway's own registration alive
pub struct SelfRegistrar {
    client: RegistryClient,
    request: RegistrationRequest,
    heartbeat_interval: Duration,
}

impl SelfRegistrar {
    pub fn new(client: RegistryClient, settings: &SelfRegistration) -> Self {
        let request = RegistrationRequest::new(
            &settings.service_id,
            &settings.instance_id,
            &settings.host,
            settings.port,
        );
        Self {
            client,
            request,
            // tokio intervals reject a zero period
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs.max(1)),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Register, heartbeat until `shutdown`, then deregister
    pub async fn run(self, shutdown: CancellationToken) {
        let (service_id, instance_id) = (&self.request.service_id, &self.request.instance_id);
        match self.client.register(&self.request).await {
            Ok(()) => info!("Registered {}/{} with the registry", service_id, instance_id),
            Err(e) => warn!("Self-registration failed, will retry on heartbeat: {}", e),
        }

        let mut ticker =
            time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.beat().await,
            }
        }

        match self.client.deregister(service_id, instance_id).await {
            Ok(()) => info!("Deregistered {}/{}", service_id, instance_id),
            Err(e) => warn!("Deregistration failed: {}", e),
        }
    }

    async fn beat(&self) {
        let (service_id, instance_id) = (&self.request.service_id, &self.request.instance_id);
        match self.client.heartbeat(service_id, instance_id).await {
            Ok(()) => debug!("Heartbeat sent for {}/{}", service_id, instance_id),
            Err(ClientError::NotRegistered { .. }) => {
                info!("Registry lost {}/{}, registering again", service_id, instance_id);
                if let Err(e) = self.client.register(&self.request).await {
                    warn!("Re-registration failed: {}", e);
                }
            }
            Err(e) => warn!("Heartbeat failed: {}", e),
        }
    }
}
