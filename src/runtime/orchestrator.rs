//! Request orchestration
//!
//! Thin composition layer over the runtime subsystems: consult the cache,
//! dispatch through the load balancer under circuit-breaker protection,
//! record the outcome in conversation memory, and publish lifecycle events.
//! Every dispatched request terminates in either a result or a typed error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use prometheus::Gauge;
use serde_json::json;
use tracing::{debug, warn};

use crate::domain::{Event, EventType, WorkRequest, WorkResult};
use crate::runtime::cache::KeyBuilder;
use crate::runtime::error::RuntimeError;
use crate::runtime::memory::ConversationMessage;
use crate::runtime::RuntimeContext;

/// Decrements the in-flight gauge on every exit path
struct InFlightGuard(Gauge);

impl InFlightGuard {
    fn enter(gauge: &Gauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

pub struct Orchestrator {
    runtime: Arc<RuntimeContext>,
}

impl Orchestrator {
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self { runtime }
    }

    pub async fn process(&self, request: WorkRequest) -> Result<WorkResult, RuntimeError> {
        let timeout = self.runtime.settings.pool.request_timeout();
        self.process_with_timeout(request, timeout).await
    }

    pub async fn process_with_timeout(
        &self,
        request: WorkRequest,
        timeout: Duration,
    ) -> Result<WorkResult, RuntimeError> {
        let _in_flight = InFlightGuard::enter(&self.runtime.metrics.requests_in_flight);
        let started = Instant::now();

        // Identical logical inputs must map to the same entry
        let cache_key = KeyBuilder::new("request")
            .part(&request.agent_type)
            .hashed(&request.payload)
            .build();

        self.publish_event(
            Event::new(EventType::RequestStarted, "orchestrator")
                .with_correlation_id(request.id)
                .with_payload_entry("agent_type", json!(request.agent_type)),
        );

        if let Some(mut cached) = self.runtime.cache.get_as::<WorkResult>(&cache_key).await {
            debug!(request = %request.id, key = %cache_key, "serving cached result");
            cached.request_id = request.id;
            cached.cached = true;
            self.record_outcome(&request, Ok(&cached), started).await;
            return Ok(cached);
        }

        let service = request.agent_type.clone();
        let balancer = self.runtime.balancer.clone();
        let dispatch_request = request.clone();
        let outcome = self
            .runtime
            .breakers
            .call(&request.agent_type, || async move {
                balancer
                    .process_request(&service, dispatch_request, timeout)
                    .await
            })
            .await;

        match outcome {
            Ok(mut result) => {
                result.elapsed_ms = started.elapsed().as_millis() as u64;
                result.cached = false;
                if let Err(e) = self
                    .runtime
                    .cache
                    .set_as(&cache_key, &result, None)
                    .await
                {
                    warn!(key = %cache_key, error = %e, "failed to cache result");
                }
                self.record_outcome(&request, Ok(&result), started).await;
                Ok(result)
            }
            Err(e) => {
                self.record_outcome(&request, Err(&e), started).await;
                Err(e)
            }
        }
    }

    /// Conversation memory entry plus the lifecycle event for one outcome
    async fn record_outcome(
        &self,
        request: &WorkRequest,
        outcome: Result<&WorkResult, &RuntimeError>,
        started: Instant,
    ) {
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Some(conversation_id) = &request.conversation_id {
            let message = match outcome {
                Ok(result) => ConversationMessage::new(
                    "runtime",
                    format!("{} request completed", request.agent_type),
                )
                .with_metadata(json!({
                    "request_id": request.id,
                    "agent_id": result.agent_id,
                    "elapsed_ms": elapsed_ms,
                    "cached": result.cached,
                    "success": true,
                })),
                Err(e) => ConversationMessage::new(
                    "runtime",
                    format!("{} request failed: {}", request.agent_type, e),
                )
                .with_metadata(json!({
                    "request_id": request.id,
                    "elapsed_ms": elapsed_ms,
                    "success": false,
                })),
            };
            self.runtime.memory.add_message(conversation_id, message).await;
        }

        let event = match outcome {
            Ok(result) => Event::new(EventType::RequestCompleted, "orchestrator")
                .with_correlation_id(request.id)
                .with_payload_entry("agent_type", json!(request.agent_type))
                .with_payload_entry("agent_id", json!(result.agent_id))
                .with_payload_entry("elapsed_ms", json!(elapsed_ms))
                .with_payload_entry("cached", json!(result.cached)),
            Err(e) => Event::new(EventType::RequestFailed, "orchestrator")
                .with_correlation_id(request.id)
                .with_payload_entry("agent_type", json!(request.agent_type))
                .with_payload_entry("error", json!(e.to_string())),
        };
        self.publish_event(event);
    }

    fn publish_event(&self, event: Event) {
        if let Err(e) = self.runtime.events.publish(event) {
            warn!(error = %e, "failed to publish lifecycle event");
        }
    }
}
