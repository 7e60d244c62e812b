//! Health probes and aggregate health state
//!
//! Probes run on independent schedules as cancelable tasks. A probe that
//! exceeds its timeout counts as a failure; a probe error marks it unhealthy
//! and the monitor keeps probing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A registered health check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    /// Critical probes drive the aggregate to `Critical` when unhealthy
    fn critical(&self) -> bool {
        false
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn check(&self) -> anyhow::Result<()>;
}

/// Probe built from an async closure, for registrations that do not warrant
/// a dedicated type
pub struct FnProbe {
    name: String,
    critical: bool,
    interval: Duration,
    timeout: Duration,
    check_fn: Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
}

impl FnProbe {
    pub fn new<F>(name: impl Into<String>, check_fn: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            critical: false,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            check_fn: Arc::new(check_fn),
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthProbe for FnProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.critical
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn check(&self) -> anyhow::Result<()> {
        (self.check_fn)().await
    }
}

/// Aggregate health across all registered probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
    /// Not yet checked; counts as healthy for aggregation
    Unknown,
    Healthy,
    Unhealthy,
    TimedOut,
}

/// Last observed status of one probe, exposed on the health-detail endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub state: ProbeState,
    pub critical: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProbeStatus {
    fn unknown(critical: bool) -> Self {
        Self {
            state: ProbeState::Unknown,
            critical,
            last_check: None,
            last_success: None,
            failure_count: 0,
            message: None,
        }
    }

    fn is_failing(&self) -> bool {
        matches!(self.state, ProbeState::Unhealthy | ProbeState::TimedOut)
    }
}

pub struct HealthMonitor {
    probes: RwLock<HashMap<String, Arc<dyn HealthProbe>>>,
    status: Arc<RwLock<HashMap<String, ProbeStatus>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            probes: RwLock::new(HashMap::new()),
            status: Arc::new(RwLock::new(HashMap::new())),
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Register a probe. If monitoring has already started, its schedule
    /// begins immediately.
    pub async fn register(&self, probe: Arc<dyn HealthProbe>) {
        let name = probe.name().to_string();
        self.status
            .write()
            .await
            .insert(name.clone(), ProbeStatus::unknown(probe.critical()));
        self.probes.write().await.insert(name.clone(), probe.clone());
        debug!(probe = %name, "registered health probe");

        if self.started.load(Ordering::SeqCst) {
            let handle = Self::spawn_probe_loop(probe, self.status.clone(), self.shutdown.subscribe());
            self.tasks.lock().await.push(handle);
        }
    }

    /// Start schedules for every registered probe
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let probes = self.probes.read().await;
        let mut tasks = self.tasks.lock().await;
        for probe in probes.values() {
            tasks.push(Self::spawn_probe_loop(
                probe.clone(),
                self.status.clone(),
                self.shutdown.subscribe(),
            ));
        }
    }

    /// Cancel all probe schedules
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.started.store(false, Ordering::SeqCst);
    }

    fn spawn_probe_loop(
        probe: Arc<dyn HealthProbe>,
        status: Arc<RwLock<HashMap<String, ProbeStatus>>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(probe.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        Self::run_probe(&probe, &status).await;
                    }
                }
            }
        })
    }

    async fn run_probe(
        probe: &Arc<dyn HealthProbe>,
        status: &Arc<RwLock<HashMap<String, ProbeStatus>>>,
    ) {
        let outcome = tokio::time::timeout(probe.timeout(), probe.check()).await;
        let now = Utc::now();

        let mut statuses = status.write().await;
        let entry = statuses
            .entry(probe.name().to_string())
            .or_insert_with(|| ProbeStatus::unknown(probe.critical()));
        entry.last_check = Some(now);

        match outcome {
            Ok(Ok(())) => {
                entry.state = ProbeState::Healthy;
                entry.last_success = Some(now);
                entry.failure_count = 0;
                entry.message = None;
            }
            Ok(Err(e)) => {
                entry.state = ProbeState::Unhealthy;
                entry.failure_count += 1;
                entry.message = Some(e.to_string());
                warn!(probe = probe.name(), error = %e, "health probe unhealthy");
            }
            Err(_) => {
                entry.state = ProbeState::TimedOut;
                entry.failure_count += 1;
                entry.message = Some(format!(
                    "health check timed out after {:?}",
                    probe.timeout()
                ));
                warn!(probe = probe.name(), "health probe timed out");
            }
        }
    }

    /// Run every registered probe once, immediately. Used by tests and the
    /// readiness path; scheduled runs do this on their own timers.
    pub async fn check_all_now(&self) {
        let probes: Vec<Arc<dyn HealthProbe>> =
            self.probes.read().await.values().cloned().collect();
        for probe in probes {
            Self::run_probe(&probe, &self.status).await;
        }
    }

    /// Critical if any critical probe is failing, degraded if any other probe
    /// is failing, healthy otherwise
    pub async fn overall_health(&self) -> OverallHealth {
        let statuses = self.status.read().await;
        let mut degraded = false;
        for status in statuses.values() {
            if status.is_failing() {
                if status.critical {
                    return OverallHealth::Critical;
                }
                degraded = true;
            }
        }
        if degraded {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        }
    }

    pub async fn details(&self) -> HashMap<String, ProbeStatus> {
        self.status.read().await.clone()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_probe(name: &str, critical: bool) -> Arc<FnProbe> {
        Arc::new(
            FnProbe::new(name, || Box::pin(async { Ok(()) }))
                .critical(critical)
                .interval(Duration::from_millis(10)),
        )
    }

    fn failing_probe(name: &str, critical: bool) -> Arc<FnProbe> {
        Arc::new(
            FnProbe::new(name, || {
                Box::pin(async { Err(anyhow::anyhow!("backend unreachable")) })
            })
            .critical(critical)
            .interval(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let monitor = HealthMonitor::new();
        monitor.register(ok_probe("cache", false)).await;
        monitor.register(ok_probe("pool", true)).await;
        monitor.check_all_now().await;
        assert_eq!(monitor.overall_health().await, OverallHealth::Healthy);
    }

    #[tokio::test]
    async fn test_noncritical_failure_degrades() {
        let monitor = HealthMonitor::new();
        monitor.register(ok_probe("pool", true)).await;
        monitor.register(failing_probe("cache", false)).await;
        monitor.check_all_now().await;
        assert_eq!(monitor.overall_health().await, OverallHealth::Degraded);
    }

    #[tokio::test]
    async fn test_critical_failure_wins() {
        let monitor = HealthMonitor::new();
        monitor.register(failing_probe("cache", false)).await;
        monitor.register(failing_probe("pool", true)).await;
        monitor.check_all_now().await;
        assert_eq!(monitor.overall_health().await, OverallHealth::Critical);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let monitor = HealthMonitor::new();
        let slow = Arc::new(
            FnProbe::new("slow", || {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            })
            .timeout(Duration::from_millis(20)),
        );
        monitor.register(slow).await;
        monitor.check_all_now().await;

        let details = monitor.details().await;
        assert_eq!(details["slow"].state, ProbeState::TimedOut);
        assert_eq!(details["slow"].failure_count, 1);
        assert_eq!(monitor.overall_health().await, OverallHealth::Degraded);
    }

    #[tokio::test]
    async fn test_recovery_clears_failure_count() {
        let monitor = HealthMonitor::new();
        let flaky_calls = Arc::new(AtomicBool::new(true));
        let calls = flaky_calls.clone();
        let probe = Arc::new(FnProbe::new("flaky", move || {
            let fail = calls.swap(false, Ordering::SeqCst);
            Box::pin(async move {
                if fail {
                    Err(anyhow::anyhow!("first call fails"))
                } else {
                    Ok(())
                }
            })
        }));
        monitor.register(probe).await;

        monitor.check_all_now().await;
        assert_eq!(monitor.details().await["flaky"].failure_count, 1);

        monitor.check_all_now().await;
        let details = monitor.details().await;
        assert_eq!(details["flaky"].state, ProbeState::Healthy);
        assert_eq!(details["flaky"].failure_count, 0);
        assert!(details["flaky"].last_success.is_some());
    }

    #[tokio::test]
    async fn test_scheduled_probes_run_until_stopped() {
        let monitor = HealthMonitor::new();
        monitor.register(ok_probe("cache", false)).await;
        monitor.start().await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.stop().await;

        let details = monitor.details().await;
        assert_eq!(details["cache"].state, ProbeState::Healthy);
    }
}
