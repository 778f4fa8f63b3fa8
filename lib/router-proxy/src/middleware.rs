//! Middleware hooks around ingress requests
//!
//! Middleware observe a request and its outcome; they cannot alter either.
//! Request rewriting belongs to route filters.

use crate::error::ProxyError;
use hyper::Request;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, span, Instrument, Level};

/// Context passed through middleware chain
#[derive(Clone, Debug)]
pub struct MiddlewareContext {
    pub method: String,
    pub path: String,
    /// Number of request headers
    pub header_count: usize,
    /// Value of `x-request-id`, when the client sent one
    pub request_id: Option<String>,
    pub started_at: Instant,
}

impl MiddlewareContext {
    /// Create a new middleware context from a request
    pub fn from_request<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            header_count: req.headers().len(),
            request_id: req
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Middleware trait for observing requests and responses
#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    /// Called before the request is dispatched
    async fn on_request(&self, _context: &MiddlewareContext) {}

    /// Called with the final status of every request
    async fn on_response(&self, _context: &MiddlewareContext, _status: u16) {}

    /// Called before `on_response` when dispatch ended in a gateway error
    async fn on_error(&self, _context: &MiddlewareContext, _error: &ProxyError) {}
}

/// Chain of middleware to execute in order
#[derive(Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add middleware to the chain
    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub async fn on_request(&self, context: &MiddlewareContext) {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_request(context).instrument(span).await;
        }
    }

    /// Process response through all middleware (in reverse order)
    pub async fn on_response(&self, context: &MiddlewareContext, status: u16) {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_response(context, status).instrument(span).await;
        }
    }

    pub async fn on_error(&self, context: &MiddlewareContext, error: &ProxyError) {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_error(context, error).instrument(span).await;
        }
    }
}

/// Access log
pub struct LoggingMiddleware;

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) {
        debug!(
            "Request: {} {} (headers: {})",
            context.method, context.path, context.header_count
        );
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) {
        info!(
            method = %context.method,
            path = %context.path,
            status,
            duration_ms = context.elapsed().as_millis() as u64,
            request_id = context.request_id.as_deref().unwrap_or("-"),
            "Request completed"
        );
    }

    async fn on_error(&self, context: &MiddlewareContext, error: &ProxyError) {
        debug!("Error: {} {} - {}", context.method, context.path, error);
    }
}
