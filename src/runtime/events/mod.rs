//! Asynchronous publish/subscribe event bus
//!
//! Publishing enqueues onto a bounded dispatch queue; a dispatch loop pulls
//! events in publish order and fans each one out to matching subscribers
//! concurrently, bounded by a global handler semaphore. Failed deliveries are
//! re-queued with exponential backoff up to the event's retry budget, then
//! moved exactly once into a bounded dead-letter set. Cross-event delivery
//! order is not guaranteed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EventBusSettings;
use crate::domain::{Event, EventType};
use crate::runtime::error::RuntimeError;
use crate::runtime::monitoring::MetricsCollector;

/// Handler contract for bus subscribers. Returning `false` counts as a
/// delivery failure for the event, same as an error would.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    fn id(&self) -> &str;

    async fn handle_event(&self, event: &Event) -> bool;
}

struct SubscriberEntry {
    subscriber: Arc<dyn EventSubscriber>,
    event_types: HashSet<EventType>,
}

#[derive(Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventBusStats {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub history_len: usize,
    pub dead_letter_len: usize,
    pub subscriber_count: usize,
}

pub struct EventBus {
    settings: EventBusSettings,
    subscribers: RwLock<HashMap<String, SubscriberEntry>>,
    tx: mpsc::Sender<Event>,
    rx: StdMutex<Option<mpsc::Receiver<Event>>>,
    history: StdMutex<VecDeque<Event>>,
    dead_letters: StdMutex<VecDeque<Event>>,
    handler_permits: Arc<Semaphore>,
    counters: BusCounters,
    metrics: Arc<MetricsCollector>,
    shutdown: watch::Sender<bool>,
    dispatch_task: StdMutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(settings: EventBusSettings, metrics: Arc<MetricsCollector>) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let (shutdown, _) = watch::channel(false);
        let handler_permits = Arc::new(Semaphore::new(settings.max_concurrent_handlers));
        Self {
            settings,
            subscribers: RwLock::new(HashMap::new()),
            tx,
            rx: StdMutex::new(Some(rx)),
            history: StdMutex::new(VecDeque::new()),
            dead_letters: StdMutex::new(VecDeque::new()),
            handler_permits,
            counters: BusCounters::default(),
            metrics,
            shutdown,
            dispatch_task: StdMutex::new(None),
        }
    }

    /// Start the dispatch loop. Idempotent; subsequent calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(mut rx) = guard.take() else {
            return;
        };
        drop(guard);

        let bus = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            info!("event bus dispatch loop started");
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    maybe = rx.recv() => match maybe {
                        Some(event) => {
                            // Fan-out runs as its own task so a slow event
                            // does not stall later events
                            let bus = bus.clone();
                            tokio::spawn(async move { bus.deliver(event).await });
                        }
                        None => break,
                    },
                }
            }
            info!("event bus dispatch loop stopped");
        });
        *self.dispatch_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Stop pulling events. In-flight deliveries run to completion.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>, event_types: &[EventType]) {
        let mut subscribers = self.subscribers.write().await;
        let entry = subscribers
            .entry(subscriber.id().to_string())
            .or_insert_with(|| SubscriberEntry {
                subscriber: subscriber.clone(),
                event_types: HashSet::new(),
            });
        entry.event_types.extend(event_types.iter().copied());
        debug!(
            subscriber = subscriber.id(),
            types = event_types.len(),
            "subscriber registered"
        );
    }

    /// Remove the given subscriptions, or all of them when `event_types` is
    /// `None`. The subscriber is dropped entirely once its last subscription
    /// goes.
    pub async fn unsubscribe(&self, subscriber_id: &str, event_types: Option<&[EventType]>) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let Some(entry) = subscribers.get_mut(subscriber_id) else {
            return false;
        };

        match event_types {
            Some(types) => {
                for t in types {
                    entry.event_types.remove(t);
                }
            }
            None => entry.event_types.clear(),
        }

        if entry.event_types.is_empty() {
            subscribers.remove(subscriber_id);
        }
        true
    }

    /// Enqueue an event for the dispatch loop. A full queue is surfaced
    /// immediately rather than blocking the publisher.
    pub fn publish(&self, event: Event) -> Result<Uuid, RuntimeError> {
        let id = event.id;
        self.record_history(event.clone());
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .events_published
            .with_label_values(&[&event.event_type.to_string()])
            .inc();

        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                RuntimeError::CapacityExhausted("event queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                RuntimeError::Internal("event bus is shut down".to_string())
            }
        })?;

        Ok(id)
    }

    /// Bypass the queue: invoke all currently matching subscribers
    /// concurrently and return their outcomes once all complete or the
    /// timeout elapses. Timed-out handlers count as failed and are not
    /// retried by this path.
    pub async fn publish_and_wait(&self, event: Event, timeout: Duration) -> Vec<bool> {
        let targets = self.matching_subscribers(&event).await;
        if targets.is_empty() {
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(targets.len());
        for subscriber in targets {
            let ev = event.clone();
            handles.push(tokio::spawn(async move {
                subscriber.handle_event(&ev).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(outcome)) => results.push(outcome),
                Ok(Err(_)) => results.push(false),
                Err(_) => results.push(false),
            }
        }
        results
    }

    /// Newest-first view of recent events, optionally filtered
    pub fn history(
        &self,
        event_type: Option<EventType>,
        source: Option<&str>,
        limit: usize,
    ) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .filter(|e| source.map_or(true, |s| e.source == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Events that exhausted their retry budget, kept for operator
    /// inspection
    pub fn dead_letters(&self) -> Vec<Event> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> EventBusStats {
        let history_len = self
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        let dead_letter_len = self
            .dead_letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        EventBusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            history_len,
            dead_letter_len,
            subscriber_count: self.subscribers.read().await.len(),
        }
    }

    fn record_history(&self, event: Event) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() >= self.settings.history_limit {
            history.pop_front();
        }
        history.push_back(event);
    }

    async fn matching_subscribers(&self, event: &Event) -> Vec<Arc<dyn EventSubscriber>> {
        let subscribers = self.subscribers.read().await;
        subscribers
            .values()
            .filter(|entry| entry.event_types.contains(&event.event_type))
            .filter(|entry| {
                event
                    .target
                    .as_deref()
                    .map_or(true, |target| target == entry.subscriber.id())
            })
            .map(|entry| entry.subscriber.clone())
            .collect()
    }

    /// Fan one event out to its matching subscribers and account for the
    /// outcome
    async fn deliver(self: Arc<Self>, event: Event) {
        let targets = self.matching_subscribers(&event).await;
        if targets.is_empty() {
            debug!(event = %event.id, event_type = %event.event_type, "no subscribers");
            return;
        }

        let mut handles = Vec::with_capacity(targets.len());
        for subscriber in targets {
            let permit = match self.handler_permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let ev = event.clone();
            let subscriber_id = subscriber.id().to_string();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let handled = subscriber.handle_event(&ev).await;
                if !handled {
                    warn!(subscriber = %subscriber_id, event = %ev.id, "handler reported failure");
                }
                handled
            }));
        }

        let mut failures = 0u64;
        let mut successes = 0u64;
        for handle in handles {
            match handle.await {
                Ok(true) => successes += 1,
                // Panicking handlers count as failures too
                _ => failures += 1,
            }
        }

        self.counters
            .delivered
            .fetch_add(successes, Ordering::Relaxed);
        self.counters.failed.fetch_add(failures, Ordering::Relaxed);
        if successes > 0 {
            self.metrics.events_delivered.inc_by(successes as f64);
        }

        if failures > 0 {
            self.handle_failed_delivery(event).await;
        }
    }

    /// Retry with exponential backoff, or dead-letter once the budget is
    /// spent. The bus is the single authority for backoff timing; breaker
    /// rejections inside handlers fail fast and do not add delay here.
    async fn handle_failed_delivery(self: &Arc<Self>, mut event: Event) {
        if event.retry_count >= event.max_retries {
            self.dead_letter(event);
            return;
        }

        event.retry_count += 1;
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        let delay = self.settings.retry_base_delay() * 2u32.saturating_pow(event.retry_count - 1);
        warn!(
            event = %event.id,
            attempt = event.retry_count,
            max_retries = event.max_retries,
            delay_ms = delay.as_millis() as u64,
            "re-queueing failed event"
        );

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(event).await.is_err() {
                warn!("event bus shut down before a retry could be re-queued");
            }
        });
    }

    fn dead_letter(&self, event: Event) {
        error!(
            event = %event.id,
            event_type = %event.event_type,
            retries = event.retry_count,
            "event moved to dead-letter set"
        );
        let mut dead_letters = self.dead_letters.lock().unwrap_or_else(|e| e.into_inner());
        if dead_letters.len() >= self.settings.dead_letter_limit {
            dead_letters.pop_front();
        }
        dead_letters.push_back(event);
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.metrics.events_dead_lettered.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Subscriber double that records deliveries and can be told to fail
    struct Recorder {
        id: String,
        calls: AtomicU32,
        succeed: bool,
    }

    impl Recorder {
        fn new(id: &str, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                calls: AtomicU32::new(0),
                succeed,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSubscriber for Recorder {
        fn id(&self) -> &str {
            &self.id
        }

        async fn handle_event(&self, _event: &Event) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.succeed
        }
    }

    fn fast_settings() -> EventBusSettings {
        EventBusSettings {
            retry_base_delay_ms: 10,
            queue_capacity: 16,
            history_limit: 100,
            dead_letter_limit: 10,
            ..EventBusSettings::default()
        }
    }

    fn bus(settings: EventBusSettings) -> Arc<EventBus> {
        let bus = Arc::new(EventBus::new(
            settings,
            Arc::new(MetricsCollector::new().unwrap()),
        ));
        bus.start();
        bus
    }

    #[tokio::test]
    async fn test_publish_delivers_to_matching_subscriber() {
        let bus = bus(fast_settings());
        let recorder = Recorder::new("sub", true);
        bus.subscribe(recorder.clone(), &[EventType::RequestCompleted])
            .await;

        bus.publish(Event::new(EventType::RequestCompleted, "test"))
            .unwrap();
        // Type mismatch, must not be delivered
        bus.publish(Event::new(EventType::RequestFailed, "test"))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.calls(), 1);

        let stats = bus.stats().await;
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_targeted_event_skips_other_subscribers() {
        let bus = bus(fast_settings());
        let intended = Recorder::new("intended", true);
        let bystander = Recorder::new("bystander", true);
        bus.subscribe(intended.clone(), &[EventType::Custom]).await;
        bus.subscribe(bystander.clone(), &[EventType::Custom]).await;

        bus.publish(Event::new(EventType::Custom, "test").with_target("intended"))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(intended.calls(), 1);
        assert_eq!(bystander.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_event_retries_then_dead_letters_once() {
        let bus = bus(fast_settings());
        let failing = Recorder::new("failing", false);
        bus.subscribe(failing.clone(), &[EventType::Custom]).await;

        bus.publish(Event::new(EventType::Custom, "test").with_max_retries(2))
            .unwrap();

        // Initial attempt plus retries at 10ms and 20ms backoff
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(failing.calls(), 3, "initial attempt plus two retries");
        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 2);

        let stats = bus.stats().await;
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.retried, 2);
    }

    #[tokio::test]
    async fn test_partial_failure_retries_event() {
        let bus = bus(fast_settings());
        let good = Recorder::new("good", true);
        let bad = Recorder::new("bad", false);
        bus.subscribe(good.clone(), &[EventType::Custom]).await;
        bus.subscribe(bad.clone(), &[EventType::Custom]).await;

        bus.publish(Event::new(EventType::Custom, "test").with_max_retries(1))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Both subscribers see the retry; the good one is simply invoked again
        assert_eq!(bad.calls(), 2);
        assert_eq!(good.calls(), 2);
        assert_eq!(bus.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_and_wait_reports_outcomes() {
        let bus = bus(fast_settings());
        let good = Recorder::new("good", true);
        let bad = Recorder::new("bad", false);
        bus.subscribe(good, &[EventType::Custom]).await;
        bus.subscribe(bad.clone(), &[EventType::Custom]).await;

        let results = bus
            .publish_and_wait(Event::new(EventType::Custom, "test"), Duration::from_secs(1))
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| **r).count(), 1);

        // No retries for the wait path
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(bad.calls(), 1);
    }

    #[tokio::test]
    async fn test_publish_and_wait_times_out_slow_handlers() {
        struct Slow;
        #[async_trait]
        impl EventSubscriber for Slow {
            fn id(&self) -> &str {
                "slow"
            }
            async fn handle_event(&self, _event: &Event) -> bool {
                tokio::time::sleep(Duration::from_secs(10)).await;
                true
            }
        }

        let bus = bus(fast_settings());
        bus.subscribe(Arc::new(Slow), &[EventType::Custom]).await;

        let results = bus
            .publish_and_wait(
                Event::new(EventType::Custom, "test"),
                Duration::from_millis(30),
            )
            .await;
        assert_eq!(results, vec![false]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = bus(fast_settings());
        let recorder = Recorder::new("sub", true);
        bus.subscribe(
            recorder.clone(),
            &[EventType::Custom, EventType::RequestCompleted],
        )
        .await;

        assert!(bus.unsubscribe("sub", Some(&[EventType::Custom])).await);
        bus.publish(Event::new(EventType::Custom, "test")).unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(recorder.calls(), 0);

        // Last subscription dropped removes the subscriber entirely
        assert!(bus.unsubscribe("sub", None).await);
        assert!(!bus.unsubscribe("sub", None).await);
        assert_eq!(bus.stats().await.subscriber_count, 0);
    }

    #[tokio::test]
    async fn test_history_filters_and_orders_newest_first() {
        let bus = bus(fast_settings());
        bus.publish(
            Event::new(EventType::RequestStarted, "orchestrator")
                .with_payload_entry("seq", json!(1)),
        )
        .unwrap();
        bus.publish(
            Event::new(EventType::RequestCompleted, "orchestrator")
                .with_payload_entry("seq", json!(2)),
        )
        .unwrap();
        bus.publish(Event::new(EventType::RequestCompleted, "other"))
            .unwrap();

        let all = bus.history(None, None, 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].source, "other");

        let completed = bus.history(Some(EventType::RequestCompleted), Some("orchestrator"), 10);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].payload["seq"], json!(2));

        let limited = bus.history(None, None, 2);
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_surfaces_capacity_error() {
        // Bus never started, so the queue fills up
        let bus = Arc::new(EventBus::new(
            EventBusSettings {
                queue_capacity: 2,
                ..fast_settings()
            },
            Arc::new(MetricsCollector::new().unwrap()),
        ));

        assert!(bus.publish(Event::new(EventType::Custom, "t")).is_ok());
        assert!(bus.publish(Event::new(EventType::Custom, "t")).is_ok());
        let result = bus.publish(Event::new(EventType::Custom, "t"));
        assert!(matches!(result, Err(RuntimeError::CapacityExhausted(_))));
    }

    #[tokio::test]
    async fn test_history_ring_is_bounded() {
        let bus = bus(EventBusSettings {
            history_limit: 3,
            ..fast_settings()
        });
        for _ in 0..5 {
            bus.publish(Event::new(EventType::Custom, "t")).unwrap();
        }
        assert_eq!(bus.stats().await.history_len, 3);
    }
}
