//! Dead letter queue for input that cannot be decoded
//!
//! Payloads that are not JSON at all never reach enrichment. The source
//! adapter hands them to a `DlqHandler` and acknowledges them so they are
//! not redelivered forever.

use crate::error::Result;
use crate::provider::Message;
use crate::sink::{SinkAdapter, SinkRecord};
use crate::types::now_millis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A rejected input message with the reason it was rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Topic the message was consumed from
    pub source_topic: String,
    /// Provider sequence on the source topic
    pub sequence: u64,
    pub delivery_count: u64,
    pub reason: String,
    /// Original payload, lossily decoded as UTF-8
    pub payload: String,
    /// Unix timestamp in milliseconds when the message was dead-lettered
    pub dead_lettered_at: u64,
}

impl DeadLetter {
    pub fn new(message: &Message, reason: impl Into<String>) -> Self {
        Self {
            source_topic: message.topic.clone(),
            sequence: message.sequence,
            delivery_count: message.delivery_count,
            reason: reason.into(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            dead_lettered_at: now_millis(),
        }
    }

    /// Stable id so a redelivered bad message is dead-lettered once
    pub fn msg_id(&self) -> String {
        format!("dlq:{}:{}", self.source_topic, self.sequence)
    }
}

/// Trait for dead letter queue handlers
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Handle a dead-lettered message
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Number of messages dead-lettered so far
    async fn count(&self) -> Result<usize>;
}

/// Publishes dead letters as JSON to a bus topic
///
/// Delivery goes through a [`SinkAdapter`], so transient publish failures
/// are retried with backoff and only an exhausted retry budget fails.
pub struct BusDlqHandler {
    sink: SinkAdapter,
    topic: String,
    count: RwLock<usize>,
}

impl BusDlqHandler {
    pub fn new(sink: SinkAdapter, topic: impl Into<String>) -> Self {
        Self {
            sink,
            topic: topic.into(),
            count: RwLock::new(0),
        }
    }
}

#[async_trait]
impl DlqHandler for BusDlqHandler {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            source_topic = %letter.source_topic,
            sequence = letter.sequence,
            reason = %letter.reason,
            dlq = %self.topic,
            "Message dead-lettered"
        );

        let record = SinkRecord::json(&self.topic, letter.msg_id(), &letter)?;
        self.sink.deliver(&record).await?;

        *self.count.write().await += 1;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(*self.count.read().await)
    }
}

/// In-memory DLQ handler for development and testing
///
/// Keeps at most `max_letters` entries, dropping the oldest.
pub struct MemoryDlqHandler {
    letters: RwLock<Vec<DeadLetter>>,
    max_letters: usize,
}

impl MemoryDlqHandler {
    pub fn new(max_letters: usize) -> Self {
        Self {
            letters: RwLock::new(Vec::new()),
            max_letters,
        }
    }

    /// Most recent letters first
    pub async fn list(&self, limit: usize) -> Vec<DeadLetter> {
        let letters = self.letters.read().await;
        letters.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            source_topic = %letter.source_topic,
            sequence = letter.sequence,
            reason = %letter.reason,
            "Message dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push(letter);
        if self.max_letters > 0 && letters.len() > self.max_letters {
            let excess = letters.len() - self.max_letters;
            letters.drain(..excess);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }
}
