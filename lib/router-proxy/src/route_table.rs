//! Route table for matching requests to target services

use crate::error::RouteConfigError;
use crate::filter::Filter;
use crate::policy::RetryPolicy;
use hyper::Method;
use router_api::{normalize_service_id, PredicateDefinition, RetryDefinition, RouteDefinition};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Path predicate of a route
#[derive(Clone, Debug, PartialEq)]
pub enum PathPredicate {
    /// Segment-aware prefix
    Prefix(String),
    /// Ant-style pattern: `*` is one segment, `**` any number of segments
    Pattern(String),
}

impl PathPredicate {
    fn from_definition(
        route_id: &str,
        definition: &PredicateDefinition,
    ) -> Result<Self, RouteConfigError> {
        let invalid = |predicate: &str| RouteConfigError::InvalidPredicate {
            route: route_id.to_string(),
            predicate: predicate.to_string(),
        };
        match definition {
            PredicateDefinition::Prefix(prefix) => {
                if !prefix.starts_with('/') || prefix.contains('*') {
                    return Err(invalid(prefix));
                }
                Ok(PathPredicate::Prefix(prefix.clone()))
            }
            PredicateDefinition::Pattern(pattern) => {
                let wildcard_ok = segments(pattern)
                    .all(|s| !s.contains('*') || s == "*" || s == "**");
                if !pattern.starts_with('/') || !wildcard_ok {
                    return Err(invalid(pattern));
                }
                Ok(PathPredicate::Pattern(pattern.clone()))
            }
        }
    }

    /// Match a request path against this predicate
    pub fn matches(&self, path: &str) -> bool {
        let path: Vec<&str> = segments(path).collect();
        match self {
            PathPredicate::Prefix(prefix) => {
                let prefix: Vec<&str> = segments(prefix).collect();
                path.len() >= prefix.len() && path[..prefix.len()] == prefix[..]
            }
            PathPredicate::Pattern(pattern) => {
                let pattern: Vec<&str> = segments(pattern).collect();
                match_segments(&pattern, &path)
            }
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((&"*", rest)) => !path.is_empty() && match_segments(rest, &path[1..]),
        Some((literal, rest)) => {
            path.first() == Some(literal) && match_segments(rest, &path[1..])
        }
    }
}

/// A validated, immutable route
#[derive(Debug)]
pub struct Route {
    pub id: String,
    pub predicate: PathPredicate,
    pub target_service_id: String,
    pub order: i32,
    /// Empty means any method
    pub methods: Vec<Method>,
    pub filters: Vec<Filter>,
    pub retry: RetryPolicy,
    /// Definition the route was built from, as listed on the management endpoint
    pub definition: RouteDefinition,
}

impl Route {
    pub fn from_definition(
        definition: &RouteDefinition,
        default_retry: &RetryDefinition,
    ) -> Result<Self, RouteConfigError> {
        let target = normalize_service_id(definition.target.trim_start_matches("lb://"));
        if target.is_empty() {
            return Err(RouteConfigError::EmptyTarget(definition.id.clone()));
        }

        let methods = definition
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
                    RouteConfigError::InvalidMethod {
                        route: definition.id.clone(),
                        method: m.clone(),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let filters = definition
            .filters
            .iter()
            .map(|f| Filter::from_definition(&definition.id, f))
            .collect::<Result<Vec<_>, _>>()?;

        let retry_definition = definition.retry.as_ref().unwrap_or(default_retry);
        let retry = RetryPolicy::from_definition(retry_definition).map_err(|method| {
            RouteConfigError::InvalidMethod {
                route: definition.id.clone(),
                method,
            }
        })?;

        Ok(Self {
            id: definition.id.clone(),
            predicate: PathPredicate::from_definition(&definition.id, &definition.predicate)?,
            target_service_id: target,
            order: definition.order,
            methods,
            filters,
            retry,
            definition: definition.clone(),
        })
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.match_method(method) && self.predicate.matches(path)
    }

    fn match_method(&self, method: &Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}

/// Ordered set of routes; the first matching route wins
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Build the table; routes are sorted by ascending order, keeping
    /// declaration order between equal values
    pub fn from_definitions(
        definitions: &[RouteDefinition],
        default_retry: &RetryDefinition,
    ) -> Result<Self, RouteConfigError> {
        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            if !seen.insert(definition.id.as_str()) {
                return Err(RouteConfigError::DuplicateId(definition.id.clone()));
            }
            routes.push(Arc::new(Route::from_definition(definition, default_retry)?));
        }
        routes.sort_by_key(|r| r.order);

        for route in &routes {
            info!(
                "Loaded route {} (order {}) -> {}",
                route.id, route.order, route.target_service_id
            );
        }
        Ok(Self { routes })
    }

    /// First route whose path predicate matches, regardless of method
    pub fn resolve(&self, path: &str) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|r| r.predicate.matches(path))
            .cloned()
    }

    /// First route matching both method and path
    pub fn resolve_request(&self, method: &Method, path: &str) -> Option<Arc<Route>> {
        let route = self.routes.iter().find(|r| r.matches(method, path)).cloned();
        debug!(
            "Resolved {} {} -> {}",
            method,
            path,
            route.as_ref().map(|r| r.id.as_str()).unwrap_or("<none>")
        );
        route
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Route definitions in evaluation order
    pub fn definitions(&self) -> Vec<RouteDefinition> {
        self.routes.iter().map(|r| r.definition.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use router_api::FilterDefinition;

    fn route(id: &str, target: &str, order: i32, predicate: PredicateDefinition) -> RouteDefinition {
        RouteDefinition {
            id: id.to_string(),
            target: target.to_string(),
            order,
            predicate,
            methods: Vec::new(),
            filters: Vec::new(),
            retry: None,
        }
    }

    fn pattern(p: &str) -> PredicateDefinition {
        PredicateDefinition::Pattern(p.to_string())
    }

    fn gateway_routes() -> RouteTable {
        RouteTable::from_definitions(
            &[
                route("default-route", "lb://fe", 1000, pattern("/**")),
                route("user-service", "lb://user", 0, pattern("/user/**")),
                route("deploy-service", "lb://deploy", 0, pattern("/deploy/**")),
                route("fe-service", "lb://fe", 0, pattern("/fe/**")),
            ],
            &RetryDefinition::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_pattern_matching() {
        let p = PathPredicate::Pattern("/user/**".into());
        assert!(p.matches("/user"));
        assert!(p.matches("/user/"));
        assert!(p.matches("/user/profile"));
        assert!(p.matches("/user/users/123"));
        assert!(!p.matches("/users"));
        assert!(!p.matches("/deploy/user"));

        let single = PathPredicate::Pattern("/api/*/items".into());
        assert!(single.matches("/api/v1/items"));
        assert!(!single.matches("/api/items"));
        assert!(!single.matches("/api/v1/v2/items"));

        let inner = PathPredicate::Pattern("/a/**/z".into());
        assert!(inner.matches("/a/z"));
        assert!(inner.matches("/a/b/c/z"));
        assert!(!inner.matches("/a/b/c"));

        assert!(PathPredicate::Pattern("/**".into()).matches("/"));
        assert!(PathPredicate::Pattern("/**".into()).matches("/xyz"));
    }

    #[test]
    fn test_prefix_matching() {
        let p = PathPredicate::Prefix("/api/v1".into());
        assert!(p.matches("/api/v1"));
        assert!(p.matches("/api/v1/users"));
        assert!(!p.matches("/api/v10"));
        assert!(!p.matches("/api"));
        assert!(PathPredicate::Prefix("/".into()).matches("/anything"));
    }

    #[test]
    fn test_routes_sorted_by_order() {
        let table = gateway_routes();
        let ids: Vec<&str> = table.routes().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["user-service", "deploy-service", "fe-service", "default-route"]
        );
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_resolve_first_match_wins() {
        let table = gateway_routes();
        assert_eq!(table.resolve("/user/profile").unwrap().id, "user-service");
        assert_eq!(table.resolve("/deploy/status").unwrap().id, "deploy-service");
        assert_eq!(table.resolve("/xyz").unwrap().id, "default-route");
        assert_eq!(table.resolve("/").unwrap().target_service_id, "fe");
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let table = gateway_routes();
        for _ in 0..100 {
            assert_eq!(table.resolve("/user/users/123").unwrap().id, "user-service");
        }
    }

    #[test]
    fn test_equal_order_keeps_declaration_order() {
        let table = RouteTable::from_definitions(
            &[
                route("first", "a", 5, pattern("/x/**")),
                route("second", "b", 5, pattern("/x/**")),
            ],
            &RetryDefinition::default(),
        )
        .unwrap();
        assert_eq!(table.resolve("/x/1").unwrap().id, "first");
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::from_definitions(
            &[route("user-service", "user", 0, pattern("/user/**"))],
            &RetryDefinition::default(),
        )
        .unwrap();
        assert!(table.resolve("/unknown-service/test").is_none());
    }

    #[test]
    fn test_method_restriction() {
        let mut def = route("reads", "user", 0, pattern("/user/**"));
        def.methods = vec!["get".to_string()];
        let table = RouteTable::from_definitions(&[def], &RetryDefinition::default()).unwrap();

        assert!(table.resolve_request(&Method::GET, "/user/1").is_some());
        assert!(table.resolve_request(&Method::POST, "/user/1").is_none());
        assert!(table.resolve("/user/1").is_some());
    }

    #[test]
    fn test_route_conversion() {
        let mut def = route("user-service", "lb://USER", 0, pattern("/user/**"));
        def.filters = vec![FilterDefinition::StripPrefix { parts: 1 }];
        let route = Route::from_definition(&def, &RetryDefinition::default()).unwrap();
        assert_eq!(route.target_service_id, "user");
        assert_eq!(route.filters, vec![Filter::StripPrefix(1)]);
        assert_eq!(route.retry.max_retries, RetryDefinition::default().max_retries);
    }

    #[test]
    fn test_invalid_definitions() {
        let defaults = RetryDefinition::default();
        let dup = RouteTable::from_definitions(
            &[
                route("a", "x", 0, pattern("/a/**")),
                route("a", "y", 1, pattern("/b/**")),
            ],
            &defaults,
        );
        assert_eq!(dup.unwrap_err(), RouteConfigError::DuplicateId("a".into()));

        let empty = Route::from_definition(&route("e", "lb://", 0, pattern("/**")), &defaults);
        assert_eq!(empty.unwrap_err(), RouteConfigError::EmptyTarget("e".into()));

        assert!(Route::from_definition(&route("p", "x", 0, pattern("/a**")), &defaults).is_err());
        assert!(Route::from_definition(&route("p", "x", 0, pattern("user/**")), &defaults).is_err());
        assert!(Route::from_definition(
            &route("p", "x", 0, PredicateDefinition::Prefix("/a/*".into())),
            &defaults
        )
        .is_err());

        let mut bad_method = route("m", "x", 0, pattern("/**"));
        bad_method.methods = vec!["G ET".to_string()];
        assert!(Route::from_definition(&bad_method, &defaults).is_err());
    }
}
