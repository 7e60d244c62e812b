//! The resilience runtime: subsystems plus the context object that owns them

pub mod cache;
pub mod error;
pub mod events;
pub mod memory;
pub mod monitoring;
pub mod orchestrator;
pub mod pool;
pub mod resilience;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Settings;
use crate::domain::{AgentHandle, Event, EventType};
use cache::{HttpKvStore, SharedStore, TieredCache};
use events::EventBus;
use memory::ConversationMemory;
use monitoring::{FnProbe, HealthMonitor, MetricsCollector, OverallHealth};
use pool::LoadBalancer;
use resilience::BreakerRegistry;

pub use orchestrator::Orchestrator;

/// Aggregated point-in-time view of every subsystem, served on the health
/// detail endpoint and usable by operator tooling
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
    pub health: OverallHealth,
    pub cache: cache::CacheStats,
    pub pools: pool::SystemPoolStats,
    pub events: events::EventBusStats,
    pub memory: memory::MemoryStats,
    pub breakers: HashMap<String, resilience::BreakerStats>,
}

/// Owns one instance of each subsystem. Constructed once per process (or per
/// test) and passed by reference — there are no module-level singletons.
pub struct RuntimeContext {
    pub settings: Settings,
    pub metrics: Arc<MetricsCollector>,
    pub health: Arc<HealthMonitor>,
    pub cache: Arc<TieredCache>,
    pub breakers: Arc<BreakerRegistry>,
    pub events: Arc<EventBus>,
    pub balancer: Arc<LoadBalancer>,
    pub memory: Arc<ConversationMemory>,
    shutdown: watch::Sender<bool>,
    started_at: Instant,
}

impl RuntimeContext {
    pub fn new(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let metrics = Arc::new(MetricsCollector::new()?);

        let shared: Option<Arc<dyn SharedStore>> = match &settings.cache.shared_url {
            Some(url) => Some(Arc::new(HttpKvStore::new(
                url.clone(),
                settings.cache.shared_timeout(),
            )?)),
            None => None,
        };

        let cache = Arc::new(TieredCache::with_shared(
            &settings.cache,
            shared,
            metrics.clone(),
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            settings.resilience.clone(),
            metrics.clone(),
        ));
        let events = Arc::new(EventBus::new(settings.events.clone(), metrics.clone()));
        let balancer = Arc::new(LoadBalancer::new(settings.pool.clone(), metrics.clone()));
        let memory = Arc::new(ConversationMemory::new(
            settings.memory.clone(),
            metrics.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            settings,
            metrics,
            health: Arc::new(HealthMonitor::new()),
            cache,
            breakers,
            events,
            balancer,
            memory,
            shutdown,
            started_at: Instant::now(),
        }))
    }

    /// Start background machinery: the event dispatch loop, probe schedules,
    /// the memory sweep, and periodic snapshot collection. Idempotent per
    /// subsystem.
    pub async fn start(self: &Arc<Self>) {
        self.events.start();
        self.register_default_probes().await;
        self.health.start().await;
        self.memory.start_sweeper(self.shutdown.subscribe());
        self.start_snapshot_collector();
        info!("runtime context started");
    }

    /// Periodically collect a system snapshot and announce it on the bus
    fn start_snapshot_collector(self: &Arc<Self>) {
        let runtime = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let interval =
                std::time::Duration::from_secs(runtime.settings.health.default_interval_secs);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick would snapshot an empty runtime
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let snapshot = runtime.system_snapshot().await;
                        let event = Event::new(EventType::HealthCheck, "runtime")
                            .with_payload_entry("health", json!(snapshot.health))
                            .with_payload_entry("total_requests", json!(snapshot.pools.total_requests))
                            .with_payload_entry("cache_hit_rate", json!(snapshot.cache.hit_rate));
                        if let Err(e) = runtime.events.publish(event) {
                            warn!(error = %e, "failed to publish health snapshot event");
                        }
                    }
                }
            }
        });
    }

    /// Cancel every background task. In-flight requests run to completion.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.balancer.shutdown();
        self.events.stop();
        self.health.stop().await;
        info!("runtime context shut down");
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Register an agent handle with its pool and announce it on the bus
    pub async fn register_agent(&self, agent_type: &str, handle: Arc<dyn AgentHandle>) {
        let agent_id = handle.id().to_string();
        self.balancer.add_agent(agent_type, handle).await;
        let event = Event::new(EventType::AgentRegistered, "runtime")
            .with_payload_entry("agent_type", json!(agent_type))
            .with_payload_entry("agent_id", json!(agent_id));
        if let Err(e) = self.events.publish(event) {
            warn!(error = %e, "failed to publish agent registration event");
        }
    }

    pub async fn remove_agent(&self, agent_type: &str, agent_id: &str) -> bool {
        let removed = self.balancer.remove_agent(agent_type, agent_id).await;
        if removed {
            let event = Event::new(EventType::AgentUnregistered, "runtime")
                .with_payload_entry("agent_type", json!(agent_type))
                .with_payload_entry("agent_id", json!(agent_id));
            if let Err(e) = self.events.publish(event) {
                warn!(error = %e, "failed to publish agent removal event");
            }
        }
        removed
    }

    pub async fn system_snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            timestamp: Utc::now(),
            uptime_secs: self.uptime_secs(),
            health: self.health.overall_health().await,
            cache: self.cache.stats().await,
            pools: self.balancer.system_stats().await,
            events: self.events.stats().await,
            memory: self.memory.stats().await,
            breakers: self.breakers.all_stats().await,
        }
    }

    /// Probes watching the runtime's own resource posture
    async fn register_default_probes(self: &Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.settings.health.default_interval_secs);
        let timeout = std::time::Duration::from_secs(self.settings.health.default_timeout_secs);

        // Degraded when the dead-letter set is filling up: deliveries are
        // terminally failing and an operator should look
        let events = self.events.clone();
        let dead_letter_limit = self.settings.events.dead_letter_limit;
        self.health
            .register(Arc::new(
                FnProbe::new("event_dead_letters", move || {
                    let events = events.clone();
                    Box::pin(async move {
                        let len = events.dead_letters().len();
                        if len * 2 >= dead_letter_limit {
                            anyhow::bail!("dead-letter set at {}/{}", len, dead_letter_limit);
                        }
                        Ok(())
                    })
                })
                .interval(interval)
                .timeout(timeout),
            ))
            .await;

        // Critical when some pool has agents but none of them is healthy
        let balancer = self.balancer.clone();
        self.health
            .register(Arc::new(
                FnProbe::new("agent_pools", move || {
                    let balancer = balancer.clone();
                    Box::pin(async move {
                        for (name, stats) in balancer.all_stats().await {
                            if stats.total_agents > 0 && stats.healthy_agents == 0 {
                                anyhow::bail!("pool {} has no healthy agents", name);
                            }
                        }
                        Ok(())
                    })
                })
                .critical(true)
                .interval(interval)
                .timeout(timeout),
            ))
            .await;
    }
}
