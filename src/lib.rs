//! # Talos - Resilience Runtime
//!
//! Talos is a resource-management and resilience runtime that mediates
//! between application request handlers and unreliable, rate-limited remote
//! worker services ("agents"). It coordinates concurrent dispatch, bounds
//! memory and cache growth, isolates failing backends, and propagates
//! lifecycle notifications between independent subsystems.
//!
//! ## Components
//!
//! - **Cache**: two-tier store (bounded local LRU + optional shared
//!   networked tier) with deterministic key generation
//! - **Resilience**: per-service circuit breakers behind a keyed registry
//! - **Events**: async publish/subscribe bus with retry and dead-lettering
//! - **Pool**: per-type agent pools with health tracking and pluggable
//!   selection strategies
//! - **Memory**: token-bounded conversation history
//! - **Monitoring**: prometheus metrics and scheduled health probes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use talos::config::Settings;
//! use talos::runtime::{Orchestrator, RuntimeContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::new()?;
//!     let runtime = RuntimeContext::new(settings)?;
//!     runtime.start().await;
//!
//!     let _orchestrator = Orchestrator::new(runtime.clone());
//!     // register agents, then submit WorkRequests through the orchestrator
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Domain**: the agent capability contract and event types
//! - **Runtime**: the subsystems plus the context object that owns them
//! - **Adapters**: axum handlers for the metrics and health endpoints
//! - **Config**: layered configuration management

pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod runtime;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::adapters::health_handler::HealthHandler;
use crate::adapters::metrics_handler::MetricsHandler;
use crate::runtime::RuntimeContext;

/// Creates the Axum router exposing the runtime's observability surfaces:
/// `/health` and `/health/live` are public; `/metrics` and `/health/detail`
/// sit behind the optional rate limit.
pub fn create_app(runtime: Arc<RuntimeContext>) -> Router {
    let health_handler = Arc::new(HealthHandler::new(runtime.clone()));
    let metrics_handler = Arc::new(MetricsHandler::new(runtime.metrics.clone()));

    let public_router = Router::new()
        .route(
            "/health",
            get({
                let handler = health_handler.clone();
                move || {
                    let h = handler.clone();
                    async move { h.health().await }
                }
            }),
        )
        .route(
            "/health/live",
            get({
                let handler = health_handler.clone();
                move || {
                    let h = handler.clone();
                    async move { h.live().await }
                }
            }),
        );

    let mut protected_router = Router::new()
        .route(
            "/metrics",
            get({
                let handler = metrics_handler.clone();
                move || {
                    let h = handler.clone();
                    async move { h.metrics().await }
                }
            }),
        )
        .route(
            "/health/detail",
            get({
                let handler = health_handler.clone();
                move || {
                    let h = handler.clone();
                    async move { h.detail().await }
                }
            }),
        );

    if let Some(rate_limit) = &runtime.settings.rate_limit {
        if rate_limit.enabled {
            let limiter = crate::adapters::rate_limit::create_limiter(
                rate_limit.requests_per_second,
                rate_limit.burst_size,
            );
            protected_router = protected_router.layer(axum::middleware::from_fn_with_state(
                limiter,
                crate::adapters::rate_limit::rate_limit_middleware,
            ));
        }
    }

    public_router.merge(protected_router).layer(
        tower_http::cors::CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    )
}
