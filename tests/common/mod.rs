//! Shared test doubles for integration tests

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use talos::domain::{AgentHandle, WorkRequest, WorkResult};
use talos::runtime::error::RuntimeError;

/// Agent double with a configurable delay and failure switch
pub struct ScriptedAgent {
    id: String,
    max_load: usize,
    load: AtomicUsize,
    delay: Duration,
    failing: AtomicBool,
    processed: AtomicU32,
}

impl ScriptedAgent {
    pub fn new(id: &str, max_load: usize) -> Arc<Self> {
        Self::with_delay(id, max_load, Duration::from_millis(0))
    }

    pub fn with_delay(id: &str, max_load: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            max_load,
            load: AtomicUsize::new(0),
            delay,
            failing: AtomicBool::new(false),
            processed: AtomicU32::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn processed(&self) -> u32 {
        self.processed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentHandle for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn max_load(&self) -> usize {
        self.max_load
    }

    fn current_load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    async fn process(&self, request: WorkRequest) -> Result<WorkResult, RuntimeError> {
        self.load.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.load.fetch_sub(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);

        if self.failing.load(Ordering::SeqCst) {
            return Err(RuntimeError::Downstream(format!(
                "{} rejected request",
                self.id
            )));
        }
        Ok(WorkResult {
            request_id: request.id,
            agent_id: self.id.clone(),
            output: json!({"echo": request.payload}),
            elapsed_ms: self.delay.as_millis() as u64,
            cached: false,
            completed_at: Utc::now(),
        })
    }
}
