//! Bus provider trait, the transport abstraction under the adapters
//!
//! The pipeline only ever publishes opaque payloads to named topics and
//! consumes them with explicit acknowledgement. Backends (NATS JetStream,
//! in-memory) implement `EventProvider` so the source and sink adapters stay
//! transport-agnostic.

use crate::config::{BusConfig, ProviderKind};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
pub mod nats;

/// Build the provider selected by the bus configuration
pub async fn connect(bus: &BusConfig) -> Result<Arc<dyn EventProvider>> {
    let provider: Arc<dyn EventProvider> = match bus.provider {
        ProviderKind::Memory => {
            tracing::warn!("Using the in-memory bus; nothing is shared with other processes");
            Arc::new(memory::MemoryProvider::new())
        }
        ProviderKind::Nats => Arc::new(nats::NatsProvider::connect(bus.nats.clone()).await?),
    };
    Ok(provider)
}

/// Core trait for bus backends
#[async_trait]
pub trait EventProvider: Send + Sync {
    /// Publish a payload to a topic, returning the provider-assigned sequence number
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64>;

    /// Publish with provider-specific options
    ///
    /// Default implementation ignores options and delegates to `publish()`.
    /// Providers that deduplicate by message id should override this.
    async fn publish_with_options(
        &self,
        topic: &str,
        payload: Bytes,
        _opts: &PublishOptions,
    ) -> Result<u64> {
        self.publish(topic, payload).await
    }

    /// Create (or resume) a durable, manually acknowledged subscription
    async fn subscribe(
        &self,
        topic: &str,
        consumer_name: &str,
        opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>>;

    /// Get provider info (message count, etc.)
    async fn info(&self) -> Result<ProviderInfo>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check, true if the provider is connected and operational
    async fn health(&self) -> Result<bool> {
        self.info().await.map(|_| true)
    }
}

/// Async subscription handle
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next message; `None` once the topic has ended
    async fn next(&mut self) -> Result<Option<PendingMessage>>;
}

/// A message as delivered by the bus
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    /// Provider sequence number
    pub sequence: u64,
    /// Deduplication id the publisher attached, if any
    pub msg_id: Option<String>,
    /// How many times this message has been delivered, this one included
    pub delivery_count: u64,
    pub payload: Bytes,
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A message pending acknowledgement
pub struct PendingMessage {
    pub message: Message,

    /// Ack callback, confirms processing
    ack_fn: AckFn,

    /// Nak callback, requests redelivery
    nak_fn: AckFn,
}

impl PendingMessage {
    pub fn new(
        message: Message,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            message,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge (request redelivery)
    pub async fn nak(self) -> Result<()> {
        (self.nak_fn)().await
    }
}

impl std::fmt::Debug for PendingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMessage")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Where a new consumer starts reading
///
/// Maps to provider-native delivery policies (e.g., NATS `DeliverPolicy`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DeliverPolicy {
    /// Deliver all retained messages
    #[default]
    All,
    /// Deliver only messages published after subscription
    New,
    /// Deliver starting from a specific sequence number
    ByStartSequence { sequence: u64 },
    /// Deliver starting from a specific timestamp (Unix milliseconds)
    ByStartTime { timestamp: u64 },
}

/// Options for publishing
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Deduplication message ID (NATS: `Nats-Msg-Id` header)
    ///
    /// Republishing the same id within the provider's duplicate window
    /// does not create a second message.
    pub msg_id: Option<String>,

    /// Timeout for the publish acknowledgement
    pub timeout: Option<Duration>,
}

impl PublishOptions {
    pub fn with_msg_id(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: Some(msg_id.into()),
            timeout: None,
        }
    }
}

/// Options for subscribing
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub deliver_policy: DeliverPolicy,
    /// Maximum delivery attempts (NATS: `MaxDeliver`)
    pub max_deliver: Option<i64>,
    /// Unacknowledged messages in flight (NATS: `MaxAckPending`)
    pub max_ack_pending: Option<i64>,
    /// Redelivery delay for unacknowledged messages
    pub ack_wait: Option<Duration>,
}

/// Provider status information
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    /// Provider name
    pub provider: String,
    /// Total messages stored
    pub messages: u64,
    /// Total bytes used
    pub bytes: u64,
    /// Number of active consumers
    pub consumers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn message() -> Message {
        Message {
            topic: "audit-events".to_string(),
            sequence: 1,
            msg_id: None,
            delivery_count: 1,
            payload: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn test_pending_message_ack() {
        let acked = Arc::new(AtomicBool::new(false));
        let flag = acked.clone();
        let pending = PendingMessage::new(
            message(),
            move || {
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            },
            || Box::pin(async { Ok(()) }),
        );
        pending.ack().await.unwrap();
        assert!(acked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pending_message_nak() {
        let naked = Arc::new(AtomicBool::new(false));
        let flag = naked.clone();
        let pending = PendingMessage::new(
            message(),
            || Box::pin(async { Ok(()) }),
            move || {
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            },
        );
        pending.nak().await.unwrap();
        assert!(naked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_deliver_policy_serde() {
        let policy: DeliverPolicy =
            serde_json::from_str(r#"{"type":"by_start_sequence","sequence":42}"#).unwrap();
        assert_eq!(policy, DeliverPolicy::ByStartSequence { sequence: 42 });

        let json = serde_json::to_string(&DeliverPolicy::New).unwrap();
        assert_eq!(json, r#"{"type":"new"}"#);
    }
}
