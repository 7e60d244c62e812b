//! Event domain types for the publish/subscribe bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Types of events flowing through the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A request was accepted by the orchestrator
    RequestStarted,
    /// A request terminated with a result
    RequestCompleted,
    /// A request terminated with an error
    RequestFailed,
    /// An agent handle was registered with a pool
    AgentRegistered,
    /// An agent handle was removed from a pool
    AgentUnregistered,
    /// A circuit breaker tripped open
    BreakerTripped,
    /// Periodic system health report
    HealthCheck,
    /// Anything a collaborator wants to route through the bus
    Custom,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::RequestStarted => "request_started",
            EventType::RequestCompleted => "request_completed",
            EventType::RequestFailed => "request_failed",
            EventType::AgentRegistered => "agent_registered",
            EventType::AgentUnregistered => "agent_unregistered",
            EventType::BreakerTripped => "breaker_tripped",
            EventType::HealthCheck => "health_check",
            EventType::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

/// Delivery priority, carried for consumers; the bus itself is FIFO
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A single event. Immutable after publication except for `retry_count`,
/// which the bus increments on redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: String,
    /// When set, only the subscriber with this id receives the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub priority: EventPriority,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    3
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source: source.into(),
            target: None,
            priority: EventPriority::Normal,
            timestamp: Utc::now(),
            payload: Map::new(),
            correlation_id: None,
            retry_count: 0,
            max_retries: default_max_retries(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}
