//! End-to-end tests through RuntimeContext and the orchestrator

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::ScriptedAgent;
use talos::config::{BreakerSettings, Settings};
use talos::domain::{EventType, WorkRequest};
use talos::runtime::error::RuntimeError;
use talos::runtime::{Orchestrator, RuntimeContext};

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.pool.acquire_poll_ms = 10;
    settings.events.retry_base_delay_ms = 10;
    settings
}

async fn started_runtime(settings: Settings) -> Arc<RuntimeContext> {
    let runtime = RuntimeContext::new(settings).unwrap();
    runtime.start().await;
    runtime
}

#[tokio::test]
async fn test_cache_ttl_scenario() {
    let runtime = started_runtime(fast_settings()).await;

    runtime
        .cache
        .set("k", b"v".to_vec(), Some(Duration::from_secs(1)))
        .await;
    assert_eq!(runtime.cache.get("k").await, Some(b"v".to_vec()));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(runtime.cache.get("k").await, None);

    runtime
        .cache
        .set("k", b"v".to_vec(), Some(Duration::from_secs(1)))
        .await;
    assert_eq!(runtime.cache.get("k").await, Some(b"v".to_vec()));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_identical_request_served_from_cache() {
    let runtime = started_runtime(fast_settings()).await;
    let agent = ScriptedAgent::new("reviewer-1", 2);
    runtime.register_agent("reviewer", agent.clone()).await;

    let orchestrator = Orchestrator::new(runtime.clone());
    let payload = json!({"document": "design.fig", "detail": 3});

    let first = orchestrator
        .process(WorkRequest::new("reviewer", payload.clone()))
        .await
        .unwrap();
    assert!(!first.cached);
    assert_eq!(agent.processed(), 1);

    // Same logical input, new request id: must hit the cache, not the agent
    let second_request = WorkRequest::new("reviewer", payload);
    let second = orchestrator.process(second_request.clone()).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.request_id, second_request.id);
    assert_eq!(agent.processed(), 1);

    // A different payload misses
    let third = orchestrator
        .process(WorkRequest::new("reviewer", json!({"document": "other.fig"})))
        .await
        .unwrap();
    assert!(!third.cached);
    assert_eq!(agent.processed(), 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_breaker_opens_and_fails_fast() {
    let mut settings = fast_settings();
    settings.resilience.services.insert(
        "reviewer".to_string(),
        BreakerSettings {
            failure_threshold: 3,
            timeout_secs: 60,
            success_threshold: 1,
        },
    );
    let runtime = started_runtime(settings).await;
    let agent = ScriptedAgent::new("reviewer-1", 2);
    agent.set_failing(true);
    runtime.register_agent("reviewer", agent.clone()).await;

    let orchestrator = Orchestrator::new(runtime.clone());

    for i in 0..3 {
        let result = orchestrator
            .process(WorkRequest::new("reviewer", json!({"seq": i})))
            .await;
        assert!(matches!(result, Err(RuntimeError::Downstream(_))));
    }
    assert_eq!(agent.processed(), 3);

    // Breaker is open now: rejected without reaching the agent
    let result = orchestrator
        .process(WorkRequest::new("reviewer", json!({"seq": 99})))
        .await;
    assert!(matches!(result, Err(RuntimeError::BreakerOpen { .. })));
    assert_eq!(agent.processed(), 3);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_three_concurrent_requests_two_slots() {
    let runtime = started_runtime(fast_settings()).await;
    let a = ScriptedAgent::with_delay("a", 1, Duration::from_millis(100));
    let b = ScriptedAgent::with_delay("b", 1, Duration::from_millis(100));
    runtime.register_agent("reviewer", a.clone()).await;
    runtime.register_agent("reviewer", b.clone()).await;

    let orchestrator = Arc::new(Orchestrator::new(runtime.clone()));
    let mut handles = Vec::new();
    for i in 0..3 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .process_with_timeout(
                    WorkRequest::new("reviewer", json!({"seq": i})),
                    Duration::from_secs(5),
                )
                .await
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(results.iter().all(|r| r.is_ok()), "no request may be lost");
    assert_eq!(a.processed() + b.processed(), 3, "no request may run twice");

    let stats = runtime.balancer.pool("reviewer").await.unwrap().stats().await;
    assert_eq!(stats.current_load, 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_lifecycle_events_published() {
    let runtime = started_runtime(fast_settings()).await;
    runtime
        .register_agent("reviewer", ScriptedAgent::new("reviewer-1", 2))
        .await;

    let orchestrator = Orchestrator::new(runtime.clone());
    let request = WorkRequest::new("reviewer", json!({"q": 1}));
    let request_id = request.id;
    orchestrator.process(request).await.unwrap();

    let started = runtime
        .events
        .history(Some(EventType::RequestStarted), Some("orchestrator"), 10);
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].correlation_id, Some(request_id));

    let completed = runtime
        .events
        .history(Some(EventType::RequestCompleted), Some("orchestrator"), 10);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].payload["agent_id"], json!("reviewer-1"));

    let registered = runtime
        .events
        .history(Some(EventType::AgentRegistered), None, 10);
    assert_eq!(registered.len(), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_conversation_memory_records_outcomes() {
    let runtime = started_runtime(fast_settings()).await;
    let agent = ScriptedAgent::new("reviewer-1", 2);
    runtime.register_agent("reviewer", agent.clone()).await;

    let orchestrator = Orchestrator::new(runtime.clone());
    orchestrator
        .process(WorkRequest::new("reviewer", json!({"q": 1})).with_conversation("conv-1"))
        .await
        .unwrap();

    agent.set_failing(true);
    let _ = orchestrator
        .process(WorkRequest::new("reviewer", json!({"q": 2})).with_conversation("conv-1"))
        .await;

    let messages = runtime.memory.get_messages("conv-1", None).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].metadata["success"], json!(true));
    assert_eq!(messages[1].metadata["success"], json!(false));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_timeout_surfaces_and_releases_slot() {
    let runtime = started_runtime(fast_settings()).await;
    runtime
        .register_agent(
            "reviewer",
            ScriptedAgent::with_delay("slow", 1, Duration::from_millis(500)),
        )
        .await;

    let orchestrator = Orchestrator::new(runtime.clone());
    let result = orchestrator
        .process_with_timeout(
            WorkRequest::new("reviewer", json!({"q": 1})),
            Duration::from_millis(50),
        )
        .await;
    assert!(matches!(result, Err(RuntimeError::Timeout(_))));

    let stats = runtime.balancer.pool("reviewer").await.unwrap().stats().await;
    assert_eq!(stats.current_load, 0, "timeout must release the slot");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_no_pool_surfaces_typed_error() {
    let runtime = started_runtime(fast_settings()).await;
    let orchestrator = Orchestrator::new(runtime.clone());

    let result = orchestrator
        .process(WorkRequest::new("nonexistent", json!({})))
        .await;
    assert!(matches!(result, Err(RuntimeError::NoSuchPool(_))));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_system_snapshot_reflects_activity() {
    let runtime = started_runtime(fast_settings()).await;
    runtime
        .register_agent("reviewer", ScriptedAgent::new("reviewer-1", 2))
        .await;

    let orchestrator = Orchestrator::new(runtime.clone());
    orchestrator
        .process(WorkRequest::new("reviewer", json!({"q": 1})))
        .await
        .unwrap();

    let snapshot = runtime.system_snapshot().await;
    assert_eq!(snapshot.pools.total_agents, 1);
    assert_eq!(snapshot.pools.total_requests, 1);
    assert_eq!(snapshot.cache.sets, 1);
    assert!(snapshot.events.published >= 2);
    assert!(snapshot.breakers.contains_key("reviewer"));

    runtime.shutdown().await;
}
