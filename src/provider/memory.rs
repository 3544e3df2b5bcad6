//! In-memory bus provider
//!
//! Single-process implementation of `EventProvider` with JetStream-like
//! semantics: per-topic retained logs, durable named consumers with explicit
//! ack/nak and redelivery, and message-id deduplication. Used by tests,
//! benches, and local runs without a NATS server.
//!
//! A topic can be closed with [`MemoryProvider::close_topic`]; subscriptions
//! on a closed topic end once every retained message has been acknowledged.
//! Resuming a durable consumer redelivers whatever an earlier session left
//! unacknowledged, as an expired ack wait would on JetStream.

use super::{
    DeliverPolicy, EventProvider, Message, PendingMessage, ProviderInfo, PublishOptions,
    SubscribeOptions, Subscription,
};
use crate::error::Result;
use crate::types::now_millis;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct TopicLog {
    messages: Vec<Message>,
    published_at: Vec<u64>,
    msg_ids: HashMap<String, u64>,
    closed: bool,
}

impl TopicLog {
    fn bytes(&self) -> u64 {
        self.messages.iter().map(|m| m.payload.len() as u64).sum()
    }
}

struct ConsumerState {
    /// Index of the next never-delivered message
    cursor: usize,
    redeliver: VecDeque<u64>,
    in_flight: HashSet<u64>,
    deliveries: HashMap<u64, u64>,
    max_deliver: Option<i64>,
}

impl ConsumerState {
    fn new(log: Option<&TopicLog>, opts: &SubscribeOptions) -> Self {
        let cursor = match (&opts.deliver_policy, log) {
            (_, None) | (DeliverPolicy::All, _) => 0,
            (DeliverPolicy::New, Some(log)) => log.messages.len(),
            (DeliverPolicy::ByStartSequence { sequence }, Some(_)) => {
                sequence.saturating_sub(1) as usize
            }
            (DeliverPolicy::ByStartTime { timestamp }, Some(log)) => log
                .published_at
                .iter()
                .position(|t| t >= timestamp)
                .unwrap_or(log.messages.len()),
        };
        Self {
            cursor,
            redeliver: VecDeque::new(),
            in_flight: HashSet::new(),
            deliveries: HashMap::new(),
            max_deliver: opts.max_deliver.filter(|m| *m > 0),
        }
    }

    fn exhausted(&self, sequence: u64) -> bool {
        match self.max_deliver {
            Some(max) => self.deliveries.get(&sequence).copied().unwrap_or(0) >= max as u64,
            None => false,
        }
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    consumers: HashMap<(String, String), ConsumerState>,
}

impl State {
    /// Next message for a consumer, redeliveries first
    fn next_for(&mut self, topic: &str, consumer: &str) -> Option<Message> {
        let log = self.topics.get(topic)?;
        let state = self
            .consumers
            .get_mut(&(topic.to_string(), consumer.to_string()))?;

        let sequence = loop {
            if let Some(seq) = state.redeliver.pop_front() {
                if state.exhausted(seq) {
                    tracing::warn!(topic, consumer, sequence = seq, "Max deliveries reached, dropping");
                    continue;
                }
                break seq;
            }
            if state.cursor < log.messages.len() {
                state.cursor += 1;
                break state.cursor as u64;
            }
            return None;
        };

        let count = state.deliveries.entry(sequence).or_insert(0);
        *count += 1;
        let delivery_count = *count;
        state.in_flight.insert(sequence);

        let mut message = log.messages.get(sequence as usize - 1)?.clone();
        message.delivery_count = delivery_count;
        Some(message)
    }

    fn drained(&self, topic: &str, consumer: &str) -> bool {
        let closed = self.topics.get(topic).map(|t| t.closed).unwrap_or(false);
        let len = self.topics.get(topic).map(|t| t.messages.len()).unwrap_or(0);
        match self.consumers.get(&(topic.to_string(), consumer.to_string())) {
            Some(c) => closed && c.cursor >= len && c.redeliver.is_empty() && c.in_flight.is_empty(),
            None => closed,
        }
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// In-memory provider
#[derive(Clone)]
pub struct MemoryProvider {
    shared: Arc<Shared>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a topic as finished; subscriptions end once they drain it
    pub async fn close_topic(&self, topic: &str) {
        let mut state = self.shared.state.lock().await;
        state.topics.entry(topic.to_string()).or_default().closed = true;
        drop(state);
        self.shared.notify.notify_waiters();
        tracing::debug!(topic, "Topic closed");
    }

    /// Every message retained on a topic, in publish order
    pub async fn messages(&self, topic: &str) -> Vec<Message> {
        let state = self.shared.state.lock().await;
        state
            .topics
            .get(topic)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    /// Payloads on a topic decoded as JSON
    pub async fn json_payloads<T: serde::de::DeserializeOwned>(&self, topic: &str) -> Result<Vec<T>> {
        self.messages(topic)
            .await
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).map_err(Into::into))
            .collect()
    }

    async fn append(&self, topic: &str, payload: Bytes, msg_id: Option<&str>) -> Result<u64> {
        let mut state = self.shared.state.lock().await;
        let log = state.topics.entry(topic.to_string()).or_default();

        if let Some(id) = msg_id {
            if let Some(seq) = log.msg_ids.get(id) {
                tracing::debug!(topic, msg_id = id, sequence = *seq, "Duplicate publish ignored");
                return Ok(*seq);
            }
        }

        let sequence = log.messages.len() as u64 + 1;
        log.messages.push(Message {
            topic: topic.to_string(),
            sequence,
            msg_id: msg_id.map(str::to_string),
            delivery_count: 0,
            payload,
        });
        log.published_at.push(now_millis());
        if let Some(id) = msg_id {
            log.msg_ids.insert(id.to_string(), sequence);
        }
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(sequence)
    }
}

#[async_trait]
impl EventProvider for MemoryProvider {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64> {
        self.append(topic, payload, None).await
    }

    async fn publish_with_options(
        &self,
        topic: &str,
        payload: Bytes,
        opts: &PublishOptions,
    ) -> Result<u64> {
        self.append(topic, payload, opts.msg_id.as_deref()).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer_name: &str,
        opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        let mut state = self.shared.state.lock().await;
        let key = (topic.to_string(), consumer_name.to_string());
        let resumed = state.consumers.get_mut(&key).map(|consumer| {
            let mut unsettled: Vec<u64> = consumer.in_flight.drain().collect();
            unsettled.sort_unstable();
            for sequence in unsettled.iter().rev() {
                consumer.redeliver.push_front(*sequence);
            }
            unsettled.len()
        });
        match resumed {
            Some(redelivering) => tracing::info!(
                topic,
                consumer = consumer_name,
                redelivering,
                "Durable subscription resumed"
            ),
            None => {
                let consumer = ConsumerState::new(state.topics.get(topic), opts);
                state.consumers.insert(key, consumer);
                tracing::info!(topic, consumer = consumer_name, "Durable subscription created");
            }
        }

        Ok(Box::new(MemorySubscription {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            consumer: consumer_name.to_string(),
        }))
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let state = self.shared.state.lock().await;
        Ok(ProviderInfo {
            provider: "memory".to_string(),
            messages: state.topics.values().map(|t| t.messages.len() as u64).sum(),
            bytes: state.topics.values().map(TopicLog::bytes).sum(),
            consumers: state.consumers.len(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Subscription handle for one durable consumer
pub struct MemorySubscription {
    shared: Arc<Shared>,
    topic: String,
    consumer: String,
}

impl MemorySubscription {
    fn pending(&self, message: Message) -> PendingMessage {
        let sequence = message.sequence;
        let key = (self.topic.clone(), self.consumer.clone());

        let ack_shared = self.shared.clone();
        let ack_key = key.clone();
        let nak_shared = self.shared.clone();

        PendingMessage::new(
            message,
            move || {
                Box::pin(async move {
                    let mut state = ack_shared.state.lock().await;
                    if let Some(c) = state.consumers.get_mut(&ack_key) {
                        c.in_flight.remove(&sequence);
                    }
                    drop(state);
                    ack_shared.notify.notify_waiters();
                    Ok(())
                })
            },
            move || {
                Box::pin(async move {
                    let mut state = nak_shared.state.lock().await;
                    if let Some(c) = state.consumers.get_mut(&key) {
                        if c.in_flight.remove(&sequence) {
                            c.redeliver.push_back(sequence);
                        }
                    }
                    drop(state);
                    nak_shared.notify.notify_waiters();
                    Ok(())
                })
            },
        )
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<PendingMessage>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().await;
                if let Some(message) = state.next_for(&self.topic, &self.consumer) {
                    drop(state);
                    return Ok(Some(self.pending(message)));
                }
                if state.drained(&self.topic, &self.consumer) {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }
}
