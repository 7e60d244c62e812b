use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;
use crate::runtime::cache::codec::Codec;
use crate::runtime::pool::strategy::SelectionStrategy;

/// Top-level runtime configuration, loaded from `talos.toml` layered with
/// `TALOS_`-prefixed environment variables and CLI overrides.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub server: ServerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub resilience: ResilienceSettings,
    #[serde(default)]
    pub events: EventBusSettings,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Two-tier cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    /// Capacity of the bounded local LRU tier
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,
    /// Default entry time-to-live in seconds
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    /// Key prefix applied to every cache entry
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
    /// Serialization codec for cached payloads
    #[serde(default)]
    pub codec: Codec,
    /// Base URL of the shared networked tier; absent means local-only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_url: Option<String>,
    /// Per-operation timeout for shared-tier calls, milliseconds
    #[serde(default = "default_shared_timeout_ms")]
    pub shared_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            local_capacity: default_local_capacity(),
            default_ttl_secs: default_cache_ttl(),
            prefix: default_cache_prefix(),
            codec: Codec::default(),
            shared_url: None,
            shared_timeout_ms: default_shared_timeout_ms(),
        }
    }
}

impl CacheSettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn shared_timeout(&self) -> Duration {
        Duration::from_millis(self.shared_timeout_ms)
    }
}

fn default_local_capacity() -> usize {
    512
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_cache_prefix() -> String {
    "talos".to_string()
}

fn default_shared_timeout_ms() -> u64 {
    500
}

/// Circuit breaker thresholds for one service
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout_secs: default_breaker_timeout(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl BreakerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    2
}

/// Registry-wide breaker configuration: a default plus per-service overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ResilienceSettings {
    #[serde(default)]
    pub default: BreakerSettings,
    #[serde(default)]
    pub services: HashMap<String, BreakerSettings>,
}

impl ResilienceSettings {
    /// Configuration for a service, falling back to the registry default
    pub fn for_service(&self, service: &str) -> BreakerSettings {
        self.services
            .get(service)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventBusSettings {
    /// Bounded event history ring size
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Bounded dead-letter set size
    #[serde(default = "default_dead_letter_limit")]
    pub dead_letter_limit: usize,
    /// Global ceiling on concurrently running handlers
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
    /// Base delay for exponential retry backoff, milliseconds
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Dispatch queue capacity; publishing into a full queue is an error
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for EventBusSettings {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
            dead_letter_limit: default_dead_letter_limit(),
            max_concurrent_handlers: default_max_concurrent_handlers(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl EventBusSettings {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

fn default_history_limit() -> usize {
    10_000
}

fn default_dead_letter_limit() -> usize {
    1_000
}

fn default_max_concurrent_handlers() -> usize {
    50
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_queue_capacity() -> usize {
    1_024
}

/// Agent pool / load balancer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolSettings {
    /// Default per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Polling interval while waiting for a free agent, milliseconds
    #[serde(default = "default_acquire_poll_ms")]
    pub acquire_poll_ms: u64,
    /// Quiescent period before a Failed agent is reset to Idle, seconds
    #[serde(default = "default_failed_reset")]
    pub failed_reset_secs: u64,
    /// Health sweep interval, seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Default selection strategy for new pools
    #[serde(default)]
    pub strategy: SelectionStrategy,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            acquire_poll_ms: default_acquire_poll_ms(),
            failed_reset_secs: default_failed_reset(),
            sweep_interval_secs: default_sweep_interval(),
            strategy: SelectionStrategy::default(),
        }
    }
}

impl PoolSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn acquire_poll_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_ms)
    }

    pub fn failed_reset_period(&self) -> Duration {
        Duration::from_secs(self.failed_reset_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_acquire_poll_ms() -> u64 {
    100
}

fn default_failed_reset() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    30
}

/// Conversation memory configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemorySettings {
    /// Message-count bound per conversation
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Token-budget bound per conversation
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Approximate characters per token used by the estimator
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f32,
    /// Conversations inactive longer than this are swept, hours
    #[serde(default = "default_inactive_hours")]
    pub inactive_hours: u64,
    /// Sweep interval, seconds
    #[serde(default = "default_memory_sweep")]
    pub sweep_interval_secs: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_tokens: default_max_tokens(),
            chars_per_token: default_chars_per_token(),
            inactive_hours: default_inactive_hours(),
            sweep_interval_secs: default_memory_sweep(),
        }
    }
}

impl MemorySettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_max_messages() -> usize {
    50
}

fn default_max_tokens() -> u32 {
    4_000
}

fn default_chars_per_token() -> f32 {
    4.0
}

fn default_inactive_hours() -> u64 {
    24
}

fn default_memory_sweep() -> u64 {
    60
}

/// Health monitor defaults applied to probes that do not override them
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthSettings {
    #[serde(default = "default_probe_interval")]
    pub default_interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub default_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            default_interval_secs: default_probe_interval(),
            default_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: u32,
    pub burst_size: u32,
}

impl Settings {
    pub fn new() -> Result<Self, anyhow::Error> {
        Self::from_file(Path::new("talos.toml"))
    }

    /// Create settings from CLI arguments (config file plus CLI overrides)
    pub fn new_with_cli(cli: &Cli) -> Result<Self, anyhow::Error> {
        let mut settings = Self::from_file(&cli.config)?;
        settings.apply_cli_overrides(cli);
        settings.validate().map_err(|errors| {
            anyhow::anyhow!("Configuration validation failed:\n{}", errors.join("\n"))
        })?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let s = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(Environment::with_prefix("TALOS").separator("__"))
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        Ok(settings)
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(shared_url) = &cli.shared_cache_url {
            self.cache.shared_url = Some(shared_url.clone());
        }
    }

    /// Sanity-check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cache.local_capacity == 0 {
            errors.push("cache.local_capacity must be at least 1".to_string());
        }
        if self.events.max_concurrent_handlers == 0 {
            errors.push("events.max_concurrent_handlers must be at least 1".to_string());
        }
        if self.events.queue_capacity == 0 {
            errors.push("events.queue_capacity must be at least 1".to_string());
        }
        if self.memory.max_messages == 0 {
            errors.push("memory.max_messages must be at least 1".to_string());
        }
        if self.memory.chars_per_token <= 0.0 {
            errors.push("memory.chars_per_token must be positive".to_string());
        }
        if self.pool.acquire_poll_ms == 0 {
            errors.push("pool.acquire_poll_ms must be at least 1".to_string());
        }
        let breakers = std::iter::once(("default", &self.resilience.default)).chain(
            self.resilience
                .services
                .iter()
                .map(|(name, breaker)| (name.as_str(), breaker)),
        );
        for (name, breaker) in breakers {
            if breaker.failure_threshold == 0 {
                errors.push(format!(
                    "resilience.{}: failure_threshold must be at least 1",
                    name
                ));
            }
            if breaker.success_threshold == 0 {
                errors.push(format!(
                    "resilience.{}: success_threshold must be at least 1",
                    name
                ));
            }
        }
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.enabled && rate_limit.requests_per_second == 0 {
                errors.push("rate_limit.requests_per_second must be at least 1".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 3000,
            },
            cache: CacheSettings::default(),
            resilience: ResilienceSettings::default(),
            events: EventBusSettings::default(),
            pool: PoolSettings::default(),
            memory: MemorySettings::default(),
            health: HealthSettings::default(),
            rate_limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.cache.local_capacity, 512);
        assert_eq!(settings.resilience.default.failure_threshold, 5);
        assert_eq!(settings.events.max_concurrent_handlers, 50);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_for_service_falls_back_to_default() {
        let mut settings = ResilienceSettings::default();
        settings.services.insert(
            "reviewer".to_string(),
            BreakerSettings {
                failure_threshold: 3,
                timeout_secs: 10,
                success_threshold: 1,
            },
        );

        assert_eq!(settings.for_service("reviewer").failure_threshold, 3);
        assert_eq!(
            settings.for_service("unknown").failure_threshold,
            default_failure_threshold()
        );
    }

    #[test]
    fn test_validation_rejects_zero_thresholds() {
        let mut settings = Settings::default();
        settings.resilience.default.failure_threshold = 0;
        settings.memory.chars_per_token = 0.0;

        let errors = settings.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }
}
