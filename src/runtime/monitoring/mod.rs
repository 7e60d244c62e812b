//! Metrics collection and health monitoring

pub mod health;

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

pub use health::{FnProbe, HealthMonitor, HealthProbe, OverallHealth, ProbeState, ProbeStatus};

/// Prometheus metrics shared by every runtime subsystem. Each counter family
/// is registered on a dedicated registry so tests can run with isolated
/// collectors.
pub struct MetricsCollector {
    registry: Registry,

    // Request metrics
    pub requests_total: CounterVec,
    pub request_duration: HistogramVec,
    pub requests_in_flight: Gauge,

    // Cache metrics
    pub cache_hits: CounterVec,
    pub cache_misses: Counter,
    pub cache_errors: Counter,

    // Event bus metrics
    pub events_published: CounterVec,
    pub events_delivered: Counter,
    pub events_dead_lettered: Counter,

    // Resilience metrics
    pub breaker_trips: CounterVec,

    // Pool metrics
    pub pool_agents: GaugeVec,
    pub pool_load: GaugeVec,

    // Conversation memory metrics
    pub conversations_active: Gauge,
}

impl MetricsCollector {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("talos_requests_total", "Total number of processed requests"),
            &["agent_type", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "talos_request_duration_seconds",
                "Request duration in seconds",
            ),
            &["agent_type"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let requests_in_flight = Gauge::new(
            "talos_requests_in_flight",
            "Number of requests currently being processed",
        )?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        let cache_hits = CounterVec::new(
            Opts::new("talos_cache_hits_total", "Cache hits by tier"),
            &["tier"],
        )?;
        registry.register(Box::new(cache_hits.clone()))?;

        let cache_misses = Counter::new("talos_cache_misses_total", "Total cache misses")?;
        registry.register(Box::new(cache_misses.clone()))?;

        let cache_errors = Counter::new(
            "talos_cache_errors_total",
            "Shared-tier cache errors degraded to misses",
        )?;
        registry.register(Box::new(cache_errors.clone()))?;

        let events_published = CounterVec::new(
            Opts::new("talos_events_published_total", "Events published by type"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let events_delivered = Counter::new(
            "talos_events_delivered_total",
            "Successful event deliveries",
        )?;
        registry.register(Box::new(events_delivered.clone()))?;

        let events_dead_lettered = Counter::new(
            "talos_events_dead_lettered_total",
            "Events moved to the dead-letter set",
        )?;
        registry.register(Box::new(events_dead_lettered.clone()))?;

        let breaker_trips = CounterVec::new(
            Opts::new("talos_breaker_trips_total", "Circuit breaker trips by service"),
            &["service"],
        )?;
        registry.register(Box::new(breaker_trips.clone()))?;

        let pool_agents = GaugeVec::new(
            Opts::new("talos_pool_agents", "Registered agents per pool"),
            &["agent_type"],
        )?;
        registry.register(Box::new(pool_agents.clone()))?;

        let pool_load = GaugeVec::new(
            Opts::new("talos_pool_load", "In-flight requests per pool"),
            &["agent_type"],
        )?;
        registry.register(Box::new(pool_load.clone()))?;

        let conversations_active = Gauge::new(
            "talos_conversations_active",
            "Conversations currently held in memory",
        )?;
        registry.register(Box::new(conversations_active.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            requests_in_flight,
            cache_hits,
            cache_misses,
            cache_errors,
            events_published,
            events_delivered,
            events_dead_lettered,
            breaker_trips,
            pool_agents,
            pool_load,
            conversations_active,
        })
    }

    /// Render the standard text exposition format
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
