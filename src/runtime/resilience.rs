//! Circuit breakers and the per-service resilience registry

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{BreakerSettings, ResilienceSettings};
use crate::runtime::error::RuntimeError;
use crate::runtime::monitoring::MetricsCollector;

/// Breaker state machine positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; consecutive failures trip to Open
    Closed,
    /// Calls rejected until the recovery timeout elapses
    Open,
    /// A bounded number of probe calls decide recovery or re-trip
    HalfOpen,
}

/// Point-in-time breaker snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub seconds_since_last_failure: Option<u64>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Probes currently in flight while HalfOpen
    half_open_inflight: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
}

/// Failure-isolation state machine for one external service.
///
/// The state check and the protected call are deliberately decoupled: the
/// internal lock is never held across the downstream await.
pub struct CircuitBreaker {
    name: String,
    config: BreakerSettings,
    inner: Mutex<BreakerInner>,
    metrics: Arc<MetricsCollector>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        config: BreakerSettings,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_inflight: 0,
                opened_at: None,
                last_failure_at: None,
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
            }),
            metrics,
        }
    }

    /// Execute `op` under breaker protection. While Open, the call is
    /// rejected with [`RuntimeError::BreakerOpen`] and `op` is never invoked.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, RuntimeError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, RuntimeError>>,
    {
        self.begin()?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Admission decision. Transitions Open → HalfOpen once the recovery
    /// timeout has elapsed, and bounds concurrent HalfOpen probes by the
    /// success threshold.
    fn begin(&self) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total_requests += 1;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.config.timeout() {
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.half_open_inflight = 1;
                    info!(breaker = %self.name, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(RuntimeError::BreakerOpen {
                        service: self.name.clone(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                let budget = inner.consecutive_successes + inner.half_open_inflight;
                if budget < self.config.success_threshold {
                    inner.half_open_inflight += 1;
                    Ok(())
                } else {
                    Err(RuntimeError::BreakerOpen {
                        service: self.name.clone(),
                    })
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.successful_requests += 1;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    Self::reset(&mut inner);
                    info!(breaker = %self.name, "circuit breaker closed");
                }
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.failed_requests += 1;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                self.trip(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_successes = 0;
        self.metrics
            .breaker_trips
            .with_label_values(&[&self.name])
            .inc();
        warn!(breaker = %self.name, "circuit breaker tripped open");
    }

    fn reset(inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_inflight = 0;
        inner.opened_at = None;
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        BreakerStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            seconds_since_last_failure: inner.last_failure_at.map(|at| at.elapsed().as_secs()),
        }
    }

    /// Operator override: trip immediately
    pub fn force_open(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.trip(&mut inner);
    }

    /// Operator override: reset to Closed with counters zeroed
    pub fn force_close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::reset(&mut inner);
        info!(breaker = %self.name, "circuit breaker force-closed");
    }
}

/// Keyed lazy factory of circuit breakers. First use of an unknown service
/// name creates a breaker with the service-specific configuration, falling
/// back to the registry default.
pub struct BreakerRegistry {
    settings: ResilienceSettings,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    metrics: Arc<MetricsCollector>,
}

impl BreakerRegistry {
    pub fn new(settings: ResilienceSettings, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            settings,
            breakers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub async fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(service) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    service,
                    self.settings.for_service(service),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    /// Execute `op` under the named service's breaker
    pub async fn call<T, F, Fut>(&self, service: &str, op: F) -> Result<T, RuntimeError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, RuntimeError>>,
    {
        self.breaker(service).await.call(op).await
    }

    pub async fn all_stats(&self) -> HashMap<String, BreakerStats> {
        self.breakers
            .read()
            .await
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.stats()))
            .collect()
    }

    /// Operator override: reset every breaker to Closed
    pub async fn reset_all(&self) {
        for breaker in self.breakers.read().await.values() {
            breaker.force_close();
        }
    }
}
