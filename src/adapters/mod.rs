//! HTTP adapters exposing the runtime's observability surfaces

pub mod health_handler;
pub mod metrics_handler;
pub mod rate_limit;
