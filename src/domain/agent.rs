//! Agent capability contract and request/result types

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::runtime::error::RuntimeError;

/// A unit of work submitted into the runtime by a collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Unique request identifier, also used as the event correlation id
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Agent type (pool name) that should process this request
    pub agent_type: String,
    /// Conversation this request belongs to, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Opaque request payload, interpreted by the agent
    pub payload: Value,
}

impl WorkRequest {
    pub fn new(agent_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_type: agent_type.into(),
            conversation_id: None,
            payload,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Result of processing a [`WorkRequest`], enriched by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResult {
    /// Id of the request this result answers
    pub request_id: Uuid,
    /// Id of the agent that produced the output
    pub agent_id: String,
    /// Opaque result payload
    pub output: Value,
    /// Wall-clock processing time in milliseconds
    pub elapsed_ms: u64,
    /// Whether this result was served from the cache
    #[serde(default)]
    pub cached: bool,
    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
}

/// Capability contract for a remote worker handle.
///
/// Handles are supplied by collaborators; the pool never constructs one.
/// `current_load` reflects the collaborator's own view of in-flight work and
/// is advisory — selection decisions use the pool's internal accounting.
#[async_trait]
pub trait AgentHandle: Send + Sync {
    /// Unique identifier within the pool
    fn id(&self) -> &str;

    /// Maximum number of concurrent requests this handle can absorb
    fn max_load(&self) -> usize;

    /// The handle's own view of its in-flight request count
    fn current_load(&self) -> usize;

    /// Process one request, returning one result or failing
    async fn process(&self, request: WorkRequest) -> Result<WorkResult, RuntimeError>;
}
