//! Route filters applied to the forwarded request and the returned response
//!
//! Filters are pure transformations: they only rewrite the message they are
//! given, using the [`FilterContext`] for anything time-dependent.

use crate::error::{ProxyError, RouteConfigError};
use chrono::{DateTime, SecondsFormat, Utc};
use hyper::body::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::http::uri::PathAndQuery;
use hyper::{Request, Response, StatusCode, Uri};
use router_api::FilterDefinition;

/// Per-request values available to filters
#[derive(Clone, Copy, Debug)]
pub struct FilterContext {
    /// When the gateway received the request
    pub received_at: DateTime<Utc>,
}

impl FilterContext {
    pub fn new(received_at: DateTime<Utc>) -> Self {
        Self { received_at }
    }
}

/// A validated filter
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// Drop the first N path segments
    StripPrefix(usize),
    PrefixPath(String),
    AddRequestHeader(HeaderName, HeaderValue),
    RemoveRequestHeader(HeaderName),
    AddResponseHeader(HeaderName, HeaderValue),
    RemoveResponseHeader(HeaderName),
    AddResponseTimestamp(HeaderName),
    SetStatus(StatusCode),
}

impl Filter {
    pub fn from_definition(
        route_id: &str,
        definition: &FilterDefinition,
    ) -> Result<Self, RouteConfigError> {
        let invalid = |reason: String| RouteConfigError::InvalidFilter {
            route: route_id.to_string(),
            reason,
        };
        let header_name = |name: &str| {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| invalid(format!("invalid header name {:?}", name)))
        };
        let header_value = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|_| invalid(format!("invalid header value {:?}", value)))
        };

        Ok(match definition {
            FilterDefinition::StripPrefix { parts } => Filter::StripPrefix(*parts),
            FilterDefinition::PrefixPath { prefix } => {
                if !prefix.starts_with('/') {
                    return Err(invalid(format!("prefix {:?} must start with '/'", prefix)));
                }
                Filter::PrefixPath(prefix.trim_end_matches('/').to_string())
            }
            FilterDefinition::AddRequestHeader { name, value } => {
                Filter::AddRequestHeader(header_name(name)?, header_value(value)?)
            }
            FilterDefinition::RemoveRequestHeader { name } => {
                Filter::RemoveRequestHeader(header_name(name)?)
            }
            FilterDefinition::AddResponseHeader { name, value } => {
                Filter::AddResponseHeader(header_name(name)?, header_value(value)?)
            }
            FilterDefinition::RemoveResponseHeader { name } => {
                Filter::RemoveResponseHeader(header_name(name)?)
            }
            FilterDefinition::AddResponseTimestamp { name } => {
                Filter::AddResponseTimestamp(header_name(name)?)
            }
            FilterDefinition::SetStatus { status } => Filter::SetStatus(
                StatusCode::from_u16(*status)
                    .map_err(|_| invalid(format!("invalid status {}", status)))?,
            ),
        })
    }

    /// Rewrite the outbound request; response-side filters leave it untouched
    pub fn apply_request(
        &self,
        request: &mut Request<Bytes>,
        _context: &FilterContext,
    ) -> Result<(), ProxyError> {
        match self {
            Filter::StripPrefix(parts) => {
                let path = strip_segments(request.uri().path(), *parts);
                set_path(request, &path)?;
            }
            Filter::PrefixPath(prefix) => {
                let path = format!("{}{}", prefix, request.uri().path());
                set_path(request, &path)?;
            }
            Filter::AddRequestHeader(name, value) => {
                request.headers_mut().append(name.clone(), value.clone());
            }
            Filter::RemoveRequestHeader(name) => {
                request.headers_mut().remove(name);
            }
            _ => {}
        }
        Ok(())
    }

    /// Rewrite the response returned to the client
    pub fn apply_response(&self, response: &mut Response<Bytes>, context: &FilterContext) {
        match self {
            Filter::AddResponseHeader(name, value) => {
                response.headers_mut().append(name.clone(), value.clone());
            }
            Filter::RemoveResponseHeader(name) => {
                response.headers_mut().remove(name);
            }
            Filter::AddResponseTimestamp(name) => {
                let stamp = context
                    .received_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true);
                if let Ok(value) = HeaderValue::from_str(&stamp) {
                    response.headers_mut().insert(name.clone(), value);
                }
            }
            Filter::SetStatus(status) => {
                *response.status_mut() = *status;
            }
            _ => {}
        }
    }
}

/// Apply request filters in declared order
pub fn apply_request_filters(
    filters: &[Filter],
    request: &mut Request<Bytes>,
    context: &FilterContext,
) -> Result<(), ProxyError> {
    for filter in filters {
        filter.apply_request(request, context)?;
    }
    Ok(())
}

/// Apply response filters in declared order
pub fn apply_response_filters(
    filters: &[Filter],
    response: &mut Response<Bytes>,
    context: &FilterContext,
) {
    for filter in filters {
        filter.apply_response(response, context);
    }
}

/// Remove the first `parts` segments, keeping a trailing slash
fn strip_segments(path: &str, parts: usize) -> String {
    let remaining: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .skip(parts)
        .collect();
    if remaining.is_empty() {
        return "/".to_string();
    }
    let mut stripped = format!("/{}", remaining.join("/"));
    if path.ends_with('/') {
        stripped.push('/');
    }
    stripped
}

/// Replace the path of the request URI, keeping its query
fn set_path(request: &mut Request<Bytes>, path: &str) -> Result<(), ProxyError> {
    let path_and_query = match request.uri().query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    let path_and_query = PathAndQuery::try_from(path_and_query.as_str())
        .map_err(|e| ProxyError::InvalidRequest(format!("rewritten path {:?}: {}", path, e)))?;

    let mut uri_parts = request.uri().clone().into_parts();
    uri_parts.path_and_query = Some(path_and_query);
    *request.uri_mut() = Uri::from_parts(uri_parts)
        .map_err(|e| ProxyError::InvalidRequest(format!("rewritten uri: {}", e)))?;
    Ok(())
}
