//! Per-agent health accounting
//!
//! One record per registered handle, mutated only under the pool's internal
//! lock. Idle ⇄ Busy ⇄ Overloaded follow purely from load; Failed is a sink
//! reachable only on a failure and exited only by the health sweep.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Smoothing factor for the response-time moving average
const EMA_ALPHA: f64 = 0.1;

/// Minimum sample size before the failure cutoff applies
const FAILURE_MIN_REQUESTS: u64 = 10;

/// Success rate below which an agent is marked Failed
const FAILURE_RATE_CUTOFF: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Overloaded,
    Failed,
    Maintenance,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub id: String,
    pub status: AgentStatus,
    pub current_load: usize,
    pub max_load: usize,
    pub avg_response_time_ms: f64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    #[serde(skip)]
    pub last_request_at: Option<Instant>,
}

impl AgentMetrics {
    pub fn new(id: impl Into<String>, max_load: usize) -> Self {
        Self {
            id: id.into(),
            status: AgentStatus::Idle,
            current_load: 0,
            max_load,
            avg_response_time_ms: 0.0,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            last_request_at: None,
        }
    }

    pub fn load_fraction(&self) -> f64 {
        if self.max_load == 0 {
            return 1.0;
        }
        self.current_load as f64 / self.max_load as f64
    }

    /// Success rate over recorded requests; optimistic 1.0 before any sample
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.successful_requests as f64 / self.total_requests as f64
    }

    /// Composite ranking score: 0.6 × spare capacity + 0.4 × success rate.
    /// Failed and Maintenance agents score 0; Overloaded agents score
    /// near-zero so they are only picked when nothing else exists.
    pub fn availability_score(&self) -> f64 {
        match self.status {
            AgentStatus::Failed | AgentStatus::Maintenance => 0.0,
            AgentStatus::Overloaded => 0.1,
            _ => 0.6 * (1.0 - self.load_fraction()) + 0.4 * self.success_rate(),
        }
    }

    /// Whether the selection pass may hand this agent a request
    pub fn is_selectable(&self) -> bool {
        matches!(self.status, AgentStatus::Idle | AgentStatus::Busy)
            && self.current_load < self.max_load
    }

    /// Account for a request being handed to this agent
    pub fn record_start(&mut self) {
        self.current_load += 1;
        self.last_request_at = Some(Instant::now());
        self.refresh_status();
    }

    /// Account for a completed request and fold its duration into the
    /// exponential moving average
    pub fn record_success(&mut self, response_time: Duration) {
        self.current_load = self.current_load.saturating_sub(1);
        self.total_requests += 1;
        self.successful_requests += 1;

        let sample_ms = response_time.as_secs_f64() * 1_000.0;
        if self.total_requests == 1 {
            self.avg_response_time_ms = sample_ms;
        } else {
            self.avg_response_time_ms =
                EMA_ALPHA * sample_ms + (1.0 - EMA_ALPHA) * self.avg_response_time_ms;
        }

        self.refresh_status();
    }

    /// Account for a failed request. Marks the agent Failed once its success
    /// rate drops below the cutoff with enough samples.
    pub fn record_failure(&mut self) {
        self.current_load = self.current_load.saturating_sub(1);
        self.total_requests += 1;
        self.failed_requests += 1;

        if self.total_requests >= FAILURE_MIN_REQUESTS && self.success_rate() < FAILURE_RATE_CUTOFF
        {
            self.status = AgentStatus::Failed;
        } else {
            self.refresh_status();
        }
    }

    /// Clear counters and return to Idle. Used by the health sweep.
    pub fn reset(&mut self) {
        self.status = AgentStatus::Idle;
        self.total_requests = 0;
        self.successful_requests = 0;
        self.failed_requests = 0;
        self.avg_response_time_ms = 0.0;
        self.refresh_status();
    }

    /// Recompute the load-driven status. Failed and Maintenance are sticky.
    fn refresh_status(&mut self) {
        if matches!(self.status, AgentStatus::Failed | AgentStatus::Maintenance) {
            return;
        }
        self.status = if self.current_load >= self.max_load {
            AgentStatus::Overloaded
        } else if self.current_load > 0 {
            AgentStatus::Busy
        } else {
            AgentStatus::Idle
        };
    }
}
