//! JetStream pull-consumer subscription

use super::config::NatsConfig;
use crate::error::{Result, StreamError};
use crate::provider::{Message, PendingMessage, Subscription};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

/// Subscription over a durable JetStream pull consumer
pub struct NatsSubscription {
    messages: jetstream::consumer::pull::Stream,
    config: Arc<NatsConfig>,
}

impl NatsSubscription {
    pub(crate) fn new(messages: jetstream::consumer::pull::Stream, config: Arc<NatsConfig>) -> Self {
        Self { messages, config }
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Result<Option<PendingMessage>> {
        let msg = match self.messages.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => return Err(StreamError::Consumer(e.to_string())),
            None => return Ok(None),
        };

        let (sequence, delivery_count) = msg
            .info()
            .map(|info| (info.stream_sequence, info.delivered.max(0) as u64))
            .unwrap_or((0, 1));

        let subject = msg.subject.to_string();
        let topic = self
            .config
            .topic_of(&subject)
            .unwrap_or(subject.as_str())
            .to_string();
        let msg_id = msg
            .headers
            .as_ref()
            .and_then(|h| h.get("Nats-Msg-Id"))
            .map(|v| v.as_str().to_string());

        let message = Message {
            topic,
            sequence,
            msg_id,
            delivery_count,
            payload: msg.payload.clone(),
        };

        let msg = Arc::new(msg);
        let ack_msg = msg.clone();
        let nak_msg = msg;

        Ok(Some(PendingMessage::new(
            message,
            move || {
                Box::pin(async move {
                    ack_msg
                        .ack()
                        .await
                        .map_err(|e| StreamError::Ack(e.to_string()))
                })
            },
            move || {
                Box::pin(async move {
                    nak_msg
                        .ack_with(jetstream::AckKind::Nak(None))
                        .await
                        .map_err(|e| StreamError::Ack(e.to_string()))
                })
            },
        )))
    }
}
