use axum::{http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

use crate::runtime::monitoring::OverallHealth;
use crate::runtime::RuntimeContext;

pub struct HealthHandler {
    runtime: Arc<RuntimeContext>,
}

impl HealthHandler {
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self { runtime }
    }

    /// Aggregate health: 200 while healthy or degraded, 503 when a critical
    /// probe is failing
    pub async fn health(&self) -> impl IntoResponse {
        let overall = self.runtime.health.overall_health().await;
        let status = match overall {
            OverallHealth::Critical => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::OK,
        };
        (
            status,
            Json(serde_json::json!({
                "status": overall,
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_seconds": self.runtime.uptime_secs(),
            })),
        )
    }

    /// Per-probe detail plus a full subsystem snapshot
    pub async fn detail(&self) -> impl IntoResponse {
        let checks = self.runtime.health.details().await;
        let snapshot = self.runtime.system_snapshot().await;
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "overall": snapshot.health,
                "checks": checks,
                "snapshot": snapshot,
            })),
        )
    }

    /// Liveness: the process is responsive
    pub async fn live(&self) -> impl IntoResponse {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "alive",
            })),
        )
    }
}
