//! Agent pools and the load balancer
//!
//! One pool per agent type. A pool tracks per-agent metrics under its own
//! lock, hands requests to agents picked by the configured strategy, and
//! runs a health sweep that gives transiently Failed agents a way back to
//! Idle.

pub mod metrics;
pub mod strategy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PoolSettings;
use crate::domain::{AgentHandle, WorkRequest, WorkResult};
use crate::runtime::error::RuntimeError;
use crate::runtime::monitoring::MetricsCollector;

pub use metrics::{AgentMetrics, AgentStatus};
pub use strategy::SelectionStrategy;

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub agent_type: String,
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub total_capacity: usize,
    pub current_load: usize,
    pub load_fraction: f64,
    pub avg_response_time_ms: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub agents: Vec<AgentMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemPoolStats {
    pub total_pools: usize,
    pub total_agents: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub overall_success_rate: f64,
    pub pools: HashMap<String, PoolStats>,
}

struct PoolInner {
    agents: HashMap<String, Arc<dyn AgentHandle>>,
    metrics: HashMap<String, AgentMetrics>,
    rr_index: usize,
}

#[derive(Default)]
struct PoolCounters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
}

pub struct AgentPool {
    agent_type: String,
    strategy: SelectionStrategy,
    settings: PoolSettings,
    inner: Mutex<PoolInner>,
    counters: PoolCounters,
    collector: Arc<MetricsCollector>,
}

impl AgentPool {
    pub fn new(
        agent_type: impl Into<String>,
        strategy: SelectionStrategy,
        settings: PoolSettings,
        collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            agent_type: agent_type.into(),
            strategy,
            settings,
            inner: Mutex::new(PoolInner {
                agents: HashMap::new(),
                metrics: HashMap::new(),
                rr_index: 0,
            }),
            counters: PoolCounters::default(),
            collector,
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub async fn add_agent(&self, handle: Arc<dyn AgentHandle>) {
        let id = handle.id().to_string();
        let max_load = handle.max_load();
        let mut inner = self.inner.lock().await;
        inner
            .metrics
            .insert(id.clone(), AgentMetrics::new(id.clone(), max_load));
        inner.agents.insert(id.clone(), handle);
        self.collector
            .pool_agents
            .with_label_values(&[&self.agent_type])
            .set(inner.agents.len() as f64);
        info!(pool = %self.agent_type, agent = %id, max_load, "agent added to pool");
    }

    pub async fn remove_agent(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let removed = inner.agents.remove(id).is_some();
        inner.metrics.remove(id);
        if removed {
            self.collector
                .pool_agents
                .with_label_values(&[&self.agent_type])
                .set(inner.agents.len() as f64);
            info!(pool = %self.agent_type, agent = %id, "agent removed from pool");
        }
        removed
    }

    /// Best available agent under the configured strategy, without
    /// reserving a slot. Callers that intend to dispatch should go through
    /// [`AgentPool::process_request`], which reserves atomically.
    pub async fn get_available_agent(&self) -> Option<Arc<dyn AgentHandle>> {
        let mut inner = self.inner.lock().await;
        let id = self.select_locked(&mut inner)?;
        inner.agents.get(&id).cloned()
    }

    /// Select and reserve: the chosen agent's load is incremented before the
    /// lock is released so concurrent acquisitions cannot overcommit a slot.
    async fn acquire(&self) -> Option<Arc<dyn AgentHandle>> {
        let mut inner = self.inner.lock().await;
        let id = self.select_locked(&mut inner)?;
        let handle = inner.agents.get(&id).cloned()?;
        if let Some(metrics) = inner.metrics.get_mut(&id) {
            metrics.record_start();
        }
        self.collector
            .pool_load
            .with_label_values(&[&self.agent_type])
            .inc();
        Some(handle)
    }

    fn select_locked(&self, inner: &mut PoolInner) -> Option<String> {
        let mut candidates: Vec<&AgentMetrics> = inner
            .metrics
            .values()
            .filter(|m| m.is_selectable())
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let mut rr_index = inner.rr_index;
        let selected = self
            .strategy
            .select(&candidates, &mut rr_index)
            .map(|id| id.to_string());
        inner.rr_index = rr_index;
        selected
    }

    async fn release_success(&self, id: &str, response_time: Duration) {
        let mut inner = self.inner.lock().await;
        if let Some(metrics) = inner.metrics.get_mut(id) {
            metrics.record_success(response_time);
        }
        self.collector
            .pool_load
            .with_label_values(&[&self.agent_type])
            .dec();
    }

    async fn release_failure(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(metrics) = inner.metrics.get_mut(id) {
            metrics.record_failure();
            if metrics.status == AgentStatus::Failed {
                warn!(pool = %self.agent_type, agent = %id, "agent marked failed, excluded from selection");
            }
        }
        self.collector
            .pool_load
            .with_label_values(&[&self.agent_type])
            .dec();
    }

    /// Dispatch one request. Waits (polling) for a free agent within the
    /// request deadline, then invokes the agent under the remaining budget.
    /// On any exit the reserved slot is released; a timeout never leaves
    /// partial work holding resources.
    pub async fn process_request(
        &self,
        request: WorkRequest,
        timeout: Duration,
    ) -> Result<WorkResult, RuntimeError> {
        let deadline = Instant::now() + timeout;
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let agent = loop {
            if let Some(agent) = self.acquire().await {
                break agent;
            }
            if Instant::now() + self.settings.acquire_poll_interval() >= deadline {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.collector
                    .requests_total
                    .with_label_values(&[&self.agent_type, "exhausted"])
                    .inc();
                return Err(RuntimeError::CapacityExhausted(self.agent_type.clone()));
            }
            tokio::time::sleep(self.settings.acquire_poll_interval()).await;
        };

        let agent_id = agent.id().to_string();
        let started = Instant::now();
        let remaining = deadline.saturating_duration_since(started);

        match tokio::time::timeout(remaining, agent.process(request)).await {
            Ok(Ok(result)) => {
                let elapsed = started.elapsed();
                self.release_success(&agent_id, elapsed).await;
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
                self.collector
                    .requests_total
                    .with_label_values(&[&self.agent_type, "success"])
                    .inc();
                self.collector
                    .request_duration
                    .with_label_values(&[&self.agent_type])
                    .observe(elapsed.as_secs_f64());
                Ok(result)
            }
            Ok(Err(e)) => {
                self.release_failure(&agent_id).await;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.collector
                    .requests_total
                    .with_label_values(&[&self.agent_type, "error"])
                    .inc();
                Err(e)
            }
            Err(_) => {
                self.release_failure(&agent_id).await;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.collector
                    .requests_total
                    .with_label_values(&[&self.agent_type, "timeout"])
                    .inc();
                Err(RuntimeError::Timeout(timeout))
            }
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let total_capacity: usize = inner.metrics.values().map(|m| m.max_load).sum();
        let current_load: usize = inner.metrics.values().map(|m| m.current_load).sum();
        let healthy = inner
            .metrics
            .values()
            .filter(|m| !matches!(m.status, AgentStatus::Failed | AgentStatus::Maintenance))
            .count();
        let avg_response_time_ms = if inner.metrics.is_empty() {
            0.0
        } else {
            inner
                .metrics
                .values()
                .map(|m| m.avg_response_time_ms)
                .sum::<f64>()
                / inner.metrics.len() as f64
        };

        let total = self.counters.total.load(Ordering::Relaxed);
        let successful = self.counters.successful.load(Ordering::Relaxed);
        let mut agents: Vec<AgentMetrics> = inner.metrics.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));

        PoolStats {
            agent_type: self.agent_type.clone(),
            total_agents: inner.agents.len(),
            healthy_agents: healthy,
            total_capacity,
            current_load,
            load_fraction: if total_capacity > 0 {
                current_load as f64 / total_capacity as f64
            } else {
                0.0
            },
            avg_response_time_ms,
            total_requests: total,
            successful_requests: successful,
            failed_requests: self.counters.failed.load(Ordering::Relaxed),
            success_rate: if total > 0 {
                successful as f64 / total as f64
            } else {
                1.0
            },
            agents,
        }
    }

    /// Spawn the periodic health sweep as a cancelable task. Failed agents
    /// quiescent for longer than the configured period are reset to Idle
    /// with cleared counters, giving transient failures a chance to
    /// self-heal.
    pub fn start_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.settings.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => pool.sweep_failed().await,
                }
            }
        })
    }

    async fn sweep_failed(&self) {
        let reset_after = self.settings.failed_reset_period();
        let mut inner = self.inner.lock().await;
        for metrics in inner.metrics.values_mut() {
            if metrics.status != AgentStatus::Failed {
                continue;
            }
            let quiescent = metrics
                .last_request_at
                .map(|at| at.elapsed() >= reset_after)
                .unwrap_or(true);
            if quiescent {
                metrics.reset();
                info!(pool = %self.agent_type, agent = %metrics.id, "failed agent reset to idle");
            }
        }
    }
}

/// Facade over the per-type pools. Pools are created lazily on first agent
/// registration, or explicitly with a strategy override.
pub struct LoadBalancer {
    settings: PoolSettings,
    pools: RwLock<HashMap<String, Arc<AgentPool>>>,
    collector: Arc<MetricsCollector>,
    shutdown: watch::Sender<bool>,
}

impl LoadBalancer {
    pub fn new(settings: PoolSettings, collector: Arc<MetricsCollector>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            settings,
            pools: RwLock::new(HashMap::new()),
            collector,
            shutdown,
        }
    }

    /// Create a pool with an explicit strategy. Fails if the pool exists.
    pub async fn create_pool(
        &self,
        agent_type: &str,
        strategy: SelectionStrategy,
    ) -> Result<Arc<AgentPool>, RuntimeError> {
        let mut pools = self.pools.write().await;
        if pools.contains_key(agent_type) {
            return Err(RuntimeError::Configuration(format!(
                "pool already exists for agent type: {}",
                agent_type
            )));
        }
        let pool = Arc::new(AgentPool::new(
            agent_type,
            strategy,
            self.settings.clone(),
            self.collector.clone(),
        ));
        pool.start_sweeper(self.shutdown.subscribe());
        pools.insert(agent_type.to_string(), pool.clone());
        info!(pool = %agent_type, ?strategy, "created agent pool");
        Ok(pool)
    }

    pub async fn pool(&self, agent_type: &str) -> Option<Arc<AgentPool>> {
        self.pools.read().await.get(agent_type).cloned()
    }

    async fn ensure_pool(&self, agent_type: &str) -> Arc<AgentPool> {
        if let Some(pool) = self.pool(agent_type).await {
            return pool;
        }
        match self.create_pool(agent_type, self.settings.strategy).await {
            Ok(pool) => pool,
            // Lost the creation race; the winner's pool is there now
            Err(_) => self
                .pool(agent_type)
                .await
                .unwrap_or_else(|| unreachable!("pool creation race lost but pool absent")),
        }
    }

    /// Register an agent handle, creating the pool on first use
    pub async fn add_agent(&self, agent_type: &str, handle: Arc<dyn AgentHandle>) {
        self.ensure_pool(agent_type).await.add_agent(handle).await;
    }

    pub async fn remove_agent(&self, agent_type: &str, id: &str) -> bool {
        match self.pool(agent_type).await {
            Some(pool) => pool.remove_agent(id).await,
            None => false,
        }
    }

    pub async fn process_request(
        &self,
        agent_type: &str,
        request: WorkRequest,
        timeout: Duration,
    ) -> Result<WorkResult, RuntimeError> {
        let pool = self
            .pool(agent_type)
            .await
            .ok_or_else(|| RuntimeError::NoSuchPool(agent_type.to_string()))?;
        pool.process_request(request, timeout).await
    }

    pub async fn all_stats(&self) -> HashMap<String, PoolStats> {
        let pools = self.pools.read().await;
        let mut stats = HashMap::with_capacity(pools.len());
        for (name, pool) in pools.iter() {
            stats.insert(name.clone(), pool.stats().await);
        }
        stats
    }

    pub async fn system_stats(&self) -> SystemPoolStats {
        let pools = self.all_stats().await;
        let total_agents = pools.values().map(|p| p.total_agents).sum();
        let total_requests: u64 = pools.values().map(|p| p.total_requests).sum();
        let successful_requests: u64 = pools.values().map(|p| p.successful_requests).sum();
        SystemPoolStats {
            total_pools: pools.len(),
            total_agents,
            total_requests,
            successful_requests,
            overall_success_rate: if total_requests > 0 {
                successful_requests as f64 / total_requests as f64
            } else {
                1.0
            },
            pools,
        }
    }

    /// Cancel every pool's health sweep
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}
