//! Registry API: HTTP + JSON over the service registry

use crate::metrics::RegistryMetrics;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use router_api::{HealthStatus, RegistrationRequest, StatusUpdate};
use router_core::{CoreError, ServiceRegistry};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Shared state of the registry server
pub struct ApiState {
    pub registry: Arc<ServiceRegistry>,
    pub metrics: RegistryMetrics,
}

#[derive(Error, Debug, PartialEq)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("method not allowed")]
    MethodNotAllowed { allow: &'static str },

    #[error("{0}")]
    Internal(String),
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InstanceNotFound { .. } => ApiError::NotFound(e.to_string()),
            CoreError::InvalidRegistration(_) => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = text(self.status(), format!("{}\n", self));
        if let ApiError::MethodNotAllowed { allow } = self {
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static(allow));
        }
        response
    }
}

type ApiResult = Result<Response<Full<Bytes>>, ApiError>;

/// Hyper entry point: buffer the body and answer the request
pub async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ApiState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let response = handle(&parts.method, parts.uri.path(), &body, &state);
    debug!("{} {} -> {}", parts.method, parts.uri.path(), response.status());
    Ok(response)
}

pub fn handle(method: &Method, path: &str, body: &Bytes, state: &ApiState) -> Response<Full<Bytes>> {
    match route(method, path, body, state) {
        Ok(response) => response,
        Err(e) => {
            if let ApiError::Internal(reason) = &e {
                warn!("Internal error serving {} {}: {}", method, path, reason);
            }
            e.into_response()
        }
    }
}

fn route(method: &Method, path: &str, body: &Bytes, state: &ApiState) -> ApiResult {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let registry = &state.registry;

    match segments.as_slice() {
        ["health"] => {
            allow(method, &[Method::GET], "GET")?;
            json(StatusCode::OK, &HealthStatus::up())
        }
        ["metrics"] => {
            allow(method, &[Method::GET], "GET")?;
            let body = state
                .metrics
                .render(&registry.stats())
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            let mut response = text(StatusCode::OK, body);
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            Ok(response)
        }
        ["registry"] => {
            allow(method, &[Method::GET], "GET")?;
            json(StatusCode::OK, &registry.snapshot())
        }
        ["registry", service_id] => {
            allow(method, &[Method::GET], "GET")?;
            json(StatusCode::OK, &registry.get_instances(service_id))
        }
        ["registry", service_id, instance_id] => {
            allow(method, &[Method::PUT, Method::DELETE], "PUT, DELETE")?;
            if *method == Method::DELETE {
                registry.deregister(service_id, instance_id);
            } else if body.iter().all(u8::is_ascii_whitespace) {
                registry.heartbeat(service_id, instance_id)?;
            } else {
                let mut request: RegistrationRequest = serde_json::from_slice(body)
                    .map_err(|e| ApiError::BadRequest(format!("invalid registration body: {}", e)))?;
                request.service_id = service_id.to_string();
                request.instance_id = instance_id.to_string();
                registry.register(request)?;
            }
            Ok(no_content())
        }
        ["registry", service_id, instance_id, "status"] => {
            allow(method, &[Method::PUT], "PUT")?;
            let update: StatusUpdate = serde_json::from_slice(body)
                .map_err(|e| ApiError::BadRequest(format!("invalid status body: {}", e)))?;
            registry.set_status(service_id, instance_id, update.status)?;
            Ok(no_content())
        }
        _ => Err(ApiError::NotFound(format!("no resource at {}", path))),
    }
}

fn allow(method: &Method, allowed: &[Method], header: &'static str) -> Result<(), ApiError> {
    if allowed.contains(method) {
        Ok(())
    } else {
        Err(ApiError::MethodNotAllowed { allow: header })
    }
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> ApiResult {
    let body = serde_json::to_vec(value).map_err(|e| ApiError::Internal(e.to_string()))?;
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn no_content() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    response
}
