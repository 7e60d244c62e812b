//! Bounded conversation memory
//!
//! Each conversation is an ordered message sequence bounded by both message
//! count and an estimated token budget; exceeding either bound evicts from
//! the oldest end. Mutations on one conversation are serialized by its own
//! lock so the running token total can never interleave.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::MemorySettings;
use crate::runtime::monitoring::MetricsCollector;

/// Cheap token estimator: characters divided by an approximate
/// characters-per-token ratio
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: f32,
}

impl TokenEstimator {
    pub fn new(chars_per_token: f32) -> Self {
        Self { chars_per_token }
    }

    pub fn estimate(&self, text: &str) -> u32 {
        (text.len() as f32 / self.chars_per_token).ceil() as u32
    }
}

/// One recorded message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Estimated token cost, fixed at insertion time
    pub tokens: u32,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl ConversationMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            timestamp: Utc::now(),
            tokens: 0,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationStats {
    pub message_count: usize,
    pub total_tokens: u32,
    pub token_utilization: f64,
    pub message_utilization: f64,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub conversation_count: usize,
    pub total_messages: usize,
    pub total_tokens: u64,
}

struct ConversationRecord {
    messages: std::collections::VecDeque<ConversationMessage>,
    total_tokens: u32,
    last_activity: DateTime<Utc>,
}

impl ConversationRecord {
    fn new() -> Self {
        Self {
            messages: std::collections::VecDeque::new(),
            total_tokens: 0,
            last_activity: Utc::now(),
        }
    }

    /// Evict from the oldest end until both bounds hold
    fn enforce_bounds(&mut self, settings: &MemorySettings) {
        while self.messages.len() > settings.max_messages
            || self.total_tokens > settings.max_tokens
        {
            match self.messages.pop_front() {
                Some(evicted) => {
                    self.total_tokens = self.total_tokens.saturating_sub(evicted.tokens);
                }
                None => break,
            }
        }
    }
}

/// Keyed store of bounded conversations
pub struct ConversationMemory {
    settings: MemorySettings,
    estimator: TokenEstimator,
    conversations: RwLock<HashMap<String, Arc<Mutex<ConversationRecord>>>>,
    collector: Arc<MetricsCollector>,
}

impl ConversationMemory {
    pub fn new(settings: MemorySettings, collector: Arc<MetricsCollector>) -> Self {
        let estimator = TokenEstimator::new(settings.chars_per_token);
        Self {
            settings,
            estimator,
            conversations: RwLock::new(HashMap::new()),
            collector,
        }
    }

    async fn record(&self, conversation_id: &str) -> Arc<Mutex<ConversationRecord>> {
        if let Some(record) = self.conversations.read().await.get(conversation_id) {
            return record.clone();
        }
        let mut conversations = self.conversations.write().await;
        let record = conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConversationRecord::new())))
            .clone();
        self.collector
            .conversations_active
            .set(conversations.len() as f64);
        record
    }

    /// Append a message, estimating its token cost and restoring the
    /// count/token bounds by evicting oldest messages as needed
    pub async fn add_message(&self, conversation_id: &str, mut message: ConversationMessage) {
        message.tokens = self.estimator.estimate(&message.content);
        let record = self.record(conversation_id).await;

        let mut record = record.lock().await;
        record.total_tokens += message.tokens;
        record.messages.push_back(message);
        record.last_activity = Utc::now();
        record.enforce_bounds(&self.settings);
    }

    /// Messages in order, optionally trimmed from the oldest end to fit a
    /// token budget
    pub async fn get_messages(
        &self,
        conversation_id: &str,
        max_tokens: Option<u32>,
    ) -> Vec<ConversationMessage> {
        let Some(record) = self.conversations.read().await.get(conversation_id).cloned() else {
            return Vec::new();
        };
        let record = record.lock().await;

        match max_tokens {
            None => record.messages.iter().cloned().collect(),
            Some(budget) => {
                let mut result = Vec::new();
                let mut spent = 0u32;
                for message in record.messages.iter().rev() {
                    if spent + message.tokens > budget {
                        break;
                    }
                    spent += message.tokens;
                    result.push(message.clone());
                }
                result.reverse();
                result
            }
        }
    }

    /// The most recent `count` messages, in order
    pub async fn get_recent(&self, conversation_id: &str, count: usize) -> Vec<ConversationMessage> {
        let Some(record) = self.conversations.read().await.get(conversation_id).cloned() else {
            return Vec::new();
        };
        let record = record.lock().await;
        let skip = record.messages.len().saturating_sub(count);
        record.messages.iter().skip(skip).cloned().collect()
    }

    /// Drop messages older than the cutoff across every conversation,
    /// returning the number removed
    pub async fn clear_older_than(&self, hours: u64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(hours as i64);
        let records: Vec<Arc<Mutex<ConversationRecord>>> =
            self.conversations.read().await.values().cloned().collect();

        let mut removed = 0;
        for record in records {
            let mut record = record.lock().await;
            while record
                .messages
                .front()
                .map(|m| m.timestamp < cutoff)
                .unwrap_or(false)
            {
                if let Some(evicted) = record.messages.pop_front() {
                    record.total_tokens = record.total_tokens.saturating_sub(evicted.tokens);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            debug!(removed, "cleared messages older than {}h", hours);
        }
        removed
    }

    /// Remove conversations whose last activity predates the configured
    /// inactive age, returning the number removed
    pub async fn sweep_inactive(&self) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(self.settings.inactive_hours as i64);
        let mut conversations = self.conversations.write().await;

        let mut stale = Vec::new();
        for (id, record) in conversations.iter() {
            let record = record.lock().await;
            if record.last_activity < cutoff {
                stale.push(id.clone());
            }
        }
        for id in &stale {
            conversations.remove(id);
        }
        self.collector
            .conversations_active
            .set(conversations.len() as f64);

        if !stale.is_empty() {
            info!(count = stale.len(), "swept inactive conversations");
        }
        stale.len()
    }

    pub async fn conversation_stats(&self, conversation_id: &str) -> Option<ConversationStats> {
        let record = self.conversations.read().await.get(conversation_id).cloned()?;
        let record = record.lock().await;
        Some(ConversationStats {
            message_count: record.messages.len(),
            total_tokens: record.total_tokens,
            token_utilization: record.total_tokens as f64 / self.settings.max_tokens as f64,
            message_utilization: record.messages.len() as f64 / self.settings.max_messages as f64,
            last_activity: record.last_activity,
        })
    }

    pub async fn stats(&self) -> MemoryStats {
        let conversations = self.conversations.read().await;
        let mut total_messages = 0;
        let mut total_tokens = 0u64;
        for record in conversations.values() {
            let record = record.lock().await;
            total_messages += record.messages.len();
            total_tokens += record.total_tokens as u64;
        }
        MemoryStats {
            conversation_count: conversations.len(),
            total_messages,
            total_tokens,
        }
    }

    /// Spawn the periodic inactive-conversation sweep as a cancelable task
    pub fn start_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let memory = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(memory.settings.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        memory.sweep_inactive().await;
                    }
                }
            }
        })
    }
}
