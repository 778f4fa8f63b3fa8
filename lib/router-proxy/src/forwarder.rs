//! HTTP request forwarding to service instances with connection pooling

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use router_api::ServiceInstance;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

/// Failure to obtain a response from an instance
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForwardError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Transport(String),

    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),
}

/// Sends a prepared request to one service instance
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(
        &self,
        instance: &ServiceInstance,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ForwardError>;
}

/// HTTP request forwarder for proxying requests to service instances
/// with connection pooling and timeout support.
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RequestForwarder {
    /// `timeout` bounds the whole exchange including the response body
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build::<_, Full<Bytes>>(connector);

        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute URI of `original` on `instance`, keeping path and query
    fn target_uri(instance: &ServiceInstance, original: &Uri) -> Result<Uri, ForwardError> {
        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("http://{}{}", instance.authority(), path_and_query);
        target
            .parse()
            .map_err(|e| ForwardError::InvalidTarget(format!("{}: {}", target, e)))
    }

    async fn exchange(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>, ForwardError> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ForwardError::Transport(e.to_string()))?;
        debug!("Instance responded with status: {}", response.status());

        let (mut parts, body) = response.into_parts();
        let bytes = body
            .collect()
            .await
            .map_err(|e| ForwardError::Transport(format!("reading response body: {}", e)))?
            .to_bytes();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, bytes))
    }
}

#[async_trait]
impl Upstream for RequestForwarder {
    async fn send(
        &self,
        instance: &ServiceInstance,
        request: Request<Bytes>,
    ) -> Result<Response<Bytes>, ForwardError> {
        let (mut parts, body) = request.into_parts();
        parts.uri = Self::target_uri(instance, &parts.uri)?;
        strip_hop_by_hop(&mut parts.headers);
        // The client derives Host from the target authority
        parts.headers.remove(HOST);

        debug!(
            "Forwarding {} {} ({} bytes)",
            parts.method,
            parts.uri,
            body.len()
        );
        let request = Request::from_parts(parts, Full::new(body));

        match tokio_timeout(self.timeout, self.exchange(request)).await {
            Ok(result) => {
                if let Err(e) = &result {
                    warn!("Request to {} failed: {}", instance.authority(), e);
                }
                result
            }
            Err(_) => {
                warn!(
                    "Request to {} timed out after {:?}",
                    instance.authority(),
                    self.timeout
                );
                Err(ForwardError::Timeout(self.timeout))
            }
        }
    }
}

/// Check if header is hop-by-hop (should not be forwarded)
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<_> = headers
        .keys()
        .filter(|k| is_hop_by_hop_header(k.as_str()))
        .cloned()
        .collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}
