//! Gateway proxy: route resolution, instance selection and request forwarding
//!
//! A request flows through [`HttpProxy::dispatch`]: the [`RouteTable`] picks
//! a route, the [`InstanceSource`] supplies live instances of the target
//! service, the [`LoadBalancer`] chooses one, the per-service
//! [`CircuitBreaker`] admits or rejects the call, and the [`Upstream`]
//! forwards it with the route's filters and retry policy applied.

pub mod discovery;
pub mod error;
pub mod filter;
pub mod forwarder;
pub mod http;
pub mod load_balancer;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod route_table;

pub use discovery::{ClientError, InstanceSource, RegistryClient, RemoteRegistry, SelfRegistrar};
pub use error::{ProxyError, RouteConfigError};
pub use filter::{Filter, FilterContext};
pub use forwarder::{ForwardError, RequestForwarder, Upstream};
pub use http::HttpProxy;
pub use load_balancer::LoadBalancer;
pub use metrics::{MetricsCollector, MetricsMiddleware};
pub use middleware::{LoggingMiddleware, Middleware, MiddlewareChain, MiddlewareContext};
pub use policy::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitOpen,
    CircuitState, RetryPolicy,
};
pub use route_table::{PathPredicate, Route, RouteTable};
