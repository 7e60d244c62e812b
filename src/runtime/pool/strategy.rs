//! Agent selection strategies
//!
//! Candidates are pre-filtered to selectable agents and sorted by id so
//! selection is deterministic for a given pool state.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::metrics::AgentMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastLoad,
    LeastResponseTime,
    #[default]
    AvailabilityBased,
}

impl SelectionStrategy {
    /// Pick one candidate id. `rr_index` is the pool's rotating cursor,
    /// advanced only by the round-robin strategy.
    pub fn select<'a>(
        &self,
        candidates: &[&'a AgentMetrics],
        rr_index: &mut usize,
    ) -> Option<&'a str> {
        if candidates.is_empty() {
            return None;
        }

        let chosen = match self {
            SelectionStrategy::RoundRobin => {
                *rr_index = (*rr_index + 1) % candidates.len();
                candidates[*rr_index]
            }
            SelectionStrategy::LeastLoad => candidates
                .iter()
                .min_by_key(|m| m.current_load)
                .copied()?,
            SelectionStrategy::LeastResponseTime => candidates
                .iter()
                .min_by(|a, b| {
                    a.avg_response_time_ms
                        .partial_cmp(&b.avg_response_time_ms)
                        .unwrap_or(Ordering::Equal)
                })
                .copied()?,
            SelectionStrategy::AvailabilityBased => candidates
                .iter()
                .max_by(|a, b| {
                    a.availability_score()
                        .partial_cmp(&b.availability_score())
                        .unwrap_or(Ordering::Equal)
                })
                .copied()?,
        };

        Some(chosen.id.as_str())
    }
}
