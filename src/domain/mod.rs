//! Core domain types shared across the runtime

pub mod agent;
pub mod event;

pub use agent::{AgentHandle, WorkRequest, WorkResult};
pub use event::{Event, EventPriority, EventType};
