//! Traffic policies for request handling: retries and per-service circuit breakers

use dashmap::DashMap;
use hyper::{Method, StatusCode};
use parking_lot::Mutex;
use rand::Rng;
use router_api::{CircuitBreakerSettings, RetryDefinition};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Retry policy for failed requests
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Methods that may be retried
    pub methods: Vec<Method>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            methods: vec![Method::GET, Method::HEAD],
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    /// Build from a definition; the error carries the first unparsable method
    pub fn from_definition(definition: &RetryDefinition) -> Result<Self, String> {
        let methods = definition
            .methods
            .iter()
            .map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| m.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            max_retries: definition.max_retries,
            methods,
            initial_backoff: Duration::from_millis(definition.initial_backoff_ms),
            max_backoff: Duration::from_millis(definition.max_backoff_ms),
            jitter: Duration::from_millis(definition.jitter_ms),
        })
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }

    /// Check if an upstream status should trigger a retry
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        )
    }

    /// Backoff before retry number `retry` (0-based), without jitter
    pub fn backoff_duration(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn backoff_with_jitter(&self, retry: u32) -> Duration {
        let base = self.backoff_duration(retry);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Circuit breaker states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected
    Open,
    /// A single trial request is allowed
    HalfOpen,
}

impl CircuitState {
    /// Value exported on the circuit state gauge
    pub fn gauge_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Failures older than this no longer count
    pub window: Duration,
    /// Time spent open before a trial call
    pub wait_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            window: Duration::from_secs(settings.window_secs),
            wait_duration: Duration::from_secs(settings.wait_duration_secs),
        }
    }
}

/// Rejection from an open circuit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitOpen {
    /// Time until a trial call may be admitted
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    window_start: Instant,
    opened_at: Instant,
    trial_in_flight: bool,
}

/// Circuit breaker for one service
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                window_start: now,
                opened_at: now,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Ask to send one call through the breaker.
    ///
    /// An open circuit whose wait has elapsed moves to half-open and hands
    /// out the single trial permit.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => Ok(CallPermit::new(self, false)),
            CircuitState::Open => {
                let reopen_at = inner.opened_at + self.config.wait_duration;
                if now < reopen_at {
                    return Err(CircuitOpen {
                        retry_after: reopen_at - now,
                    });
                }
                info!("Circuit breaker for {}: half-open, admitting trial call", self.name);
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(CallPermit::new(self, true))
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(CircuitOpen {
                        retry_after: Duration::from_secs(1),
                    });
                }
                inner.trial_in_flight = true;
                Ok(CallPermit::new(self, true))
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen if trial => {
                info!("Circuit breaker for {}: trial succeeded, closing", self.name);
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.trial_in_flight = false;
            }
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {
                if inner.failures == 0 || now.duration_since(inner.window_start) > self.config.window {
                    inner.failures = 0;
                    inner.window_start = now;
                }
                inner.failures += 1;
                debug!(
                    "Circuit breaker for {}: {} consecutive failures",
                    self.name, inner.failures
                );
                if inner.failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker for {}: opening after {} failures",
                        self.name, inner.failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = now;
                }
            }
            CircuitState::HalfOpen if trial => {
                warn!("Circuit breaker for {}: trial failed, reopening", self.name);
                inner.state = CircuitState::Open;
                inner.opened_at = now;
                inner.trial_in_flight = false;
            }
            _ => {}
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

/// Admission to call through a breaker; record the outcome with
/// [`CallPermit::success`] or [`CallPermit::failure`]. Dropping an unrecorded
/// trial permit frees the trial slot without changing state.
#[must_use]
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    recorded: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            recorded: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.recorded = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.recorded {
            self.breaker.release_trial();
        }
    }
}

/// Circuit breakers keyed by service id, created on first use
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, service_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(service_id) {
            return breaker.clone();
        }
        self.breakers
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service_id, self.config.clone())))
            .clone()
    }

    /// Current state of every known breaker, sorted by service id
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "user",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                window: Duration::from_secs(60),
                wait_duration: Duration::from_secs(30),
            },
        )
    }

    fn fail(cb: &CircuitBreaker) {
        cb.try_acquire().unwrap().failure();
    }

    #[test]
    fn test_retryable_status() {
        assert!(RetryPolicy::is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(RetryPolicy::is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(RetryPolicy::is_retryable_status(StatusCode::GATEWAY_TIMEOUT));
        assert!(!RetryPolicy::is_retryable_status(StatusCode::OK));
        assert!(!RetryPolicy::is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!RetryPolicy::is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(50));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(10), Duration::from_secs(2));
        assert_eq!(policy.backoff_duration(64), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let backoff = policy.backoff_with_jitter(1);
            assert!(backoff >= Duration::from_millis(100));
            assert!(backoff <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_retry_policy_from_definition() {
        let policy = RetryPolicy::from_definition(&RetryDefinition {
            methods: vec!["get".into(), "POST".into()],
            ..RetryDefinition::default()
        })
        .unwrap();
        assert!(policy.allows_method(&Method::GET));
        assert!(policy.allows_method(&Method::POST));
        assert!(!policy.allows_method(&Method::DELETE));

        let bad = RetryPolicy::from_definition(&RetryDefinition {
            methods: vec!["NOT A METHOD".into()],
            ..RetryDefinition::default()
        });
        assert_eq!(bad.unwrap_err(), "NOT A METHOD");
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_closed_to_open() {
        let cb = breaker(3);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);

        // Third failure should open circuit
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        let rejected = cb.try_acquire().unwrap_err();
        assert_eq!(rejected.retry_after, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3);
        fail(&cb);
        fail(&cb);
        cb.try_acquire().unwrap().success();
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let cb = breaker(3);
        fail(&cb);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_success() {
        let cb = breaker(1);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            cb.try_acquire().unwrap_err().retry_after,
            Duration::from_secs(20)
        );

        tokio::time::advance(Duration::from_secs(20)).await;
        let trial = cb.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Only one trial at a time
        assert!(cb.try_acquire().is_err());

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_failure_reopens() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        cb.try_acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(
            cb.try_acquire().unwrap_err().retry_after,
            Duration::from_secs(30)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_permit_frees_slot() {
        let cb = breaker(1);
        fail(&cb);
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(cb.try_acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_results_ignored_while_open() {
        let cb = breaker(2);
        let slow = cb.try_acquire().unwrap();
        fail(&cb);
        fail(&cb);
        assert_eq!(cb.state(), CircuitState::Open);

        // A call admitted before the circuit opened cannot close it
        slow.success();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_registry_shares_breakers_per_service() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        });
        registry.get("user").try_acquire().unwrap().failure();

        assert_eq!(registry.get("user").state(), CircuitState::Open);
        assert_eq!(registry.get("deploy").state(), CircuitState::Closed);
        assert_eq!(
            registry.states(),
            vec![
                ("deploy".to_string(), CircuitState::Closed),
                ("user".to_string(), CircuitState::Open),
            ]
        );
    }

    #[test]
    fn test_gauge_values() {
        assert_eq!(CircuitState::Closed.gauge_value(), 0);
        assert_eq!(CircuitState::Open.gauge_value(), 1);
        assert_eq!(CircuitState::HalfOpen.gauge_value(), 2);
    }
}
