//! Source adapter: bus messages in, raw events and watermarks out
//!
//! Delivery is at-least-once. The adapter decodes each payload, routes
//! payloads that are not JSON to the dead letter queue, resolves the event
//! time, and advances the bounded out-of-orderness watermark. A record
//! keeps its `delivery` until the enriched event derived from it has been
//! published; only then is the input message acknowledged.

use crate::clock::SharedClock;
use crate::dlq::{DeadLetter, DlqHandler};
use crate::error::Result;
use crate::provider::{PendingMessage, Subscription};
use crate::types::RawEvent;
use crate::watermark::{BoundedOutOfOrderness, Watermark};
use std::sync::Arc;

/// One decoded input record awaiting acknowledgement
#[derive(Debug)]
pub struct SourceRecord {
    pub event: RawEvent,
    /// Stable identity of the input message (`topic:sequence`)
    pub origin: String,
    /// New watermark produced by this record, if the watermark advanced
    pub watermark: Option<Watermark>,
    pub delivery: PendingMessage,
}

pub struct SourceAdapter {
    subscription: Box<dyn Subscription>,
    dlq: Arc<dyn DlqHandler>,
    watermarks: BoundedOutOfOrderness,
    clock: SharedClock,
    received: u64,
    dead_lettered: u64,
}

impl SourceAdapter {
    pub fn new(
        subscription: Box<dyn Subscription>,
        dlq: Arc<dyn DlqHandler>,
        watermarks: BoundedOutOfOrderness,
        clock: SharedClock,
    ) -> Self {
        Self {
            subscription,
            dlq,
            watermarks,
            clock,
            received: 0,
            dead_lettered: 0,
        }
    }

    /// Next decodable record; `None` once the input has ended
    ///
    /// Undecodable payloads are dead-lettered and acknowledged here and never
    /// returned. If the dead letter queue itself fails, the message is
    /// nak'd and the error is returned.
    pub async fn next(&mut self) -> Result<Option<SourceRecord>> {
        loop {
            let Some(pending) = self.subscription.next().await? else {
                return Ok(None);
            };
            self.received += 1;

            let mut event = match RawEvent::from_slice(&pending.message.payload) {
                Ok(event) => event,
                Err(e) => {
                    self.dead_letter(pending, e.to_string()).await?;
                    continue;
                }
            };

            event.event_time = event
                .declared_event_time()
                .unwrap_or_else(|| self.clock.now_millis());
            let watermark = self.watermarks.on_event(event.event_time);

            let origin = if pending.message.sequence > 0 {
                format!("{}:{}", pending.message.topic, pending.message.sequence)
            } else {
                uuid::Uuid::new_v4().to_string()
            };

            tracing::trace!(
                origin = %origin,
                event_type = %event.event_type,
                event_time = event.event_time,
                delivery_count = pending.message.delivery_count,
                "Event received"
            );

            return Ok(Some(SourceRecord {
                event,
                origin,
                watermark,
                delivery: pending,
            }));
        }
    }

    async fn dead_letter(&mut self, pending: PendingMessage, reason: String) -> Result<()> {
        let letter = DeadLetter::new(&pending.message, reason);
        match self.dlq.handle(letter).await {
            Ok(()) => {
                self.dead_lettered += 1;
                if let Err(e) = pending.ack().await {
                    tracing::warn!(error = %e, "Failed to ack dead-lettered message");
                }
                Ok(())
            }
            Err(e) => {
                if let Err(nak_err) = pending.nak().await {
                    tracing::warn!(error = %nak_err, "Failed to nak message");
                }
                Err(e)
            }
        }
    }

    /// Messages pulled from the bus, dead-lettered ones included
    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dlq::MemoryDlqHandler;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::{EventProvider, SubscribeOptions};
    use bytes::Bytes;

    async fn adapter(
        provider: &MemoryProvider,
        dlq: Arc<MemoryDlqHandler>,
        clock: &ManualClock,
    ) -> SourceAdapter {
        let sub = provider
            .subscribe("in", "group", &SubscribeOptions::default())
            .await
            .unwrap();
        SourceAdapter::new(
            sub,
            dlq,
            BoundedOutOfOrderness::new(20_000),
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn test_decodes_and_resolves_event_time() {
        let provider = MemoryProvider::new();
        provider
            .publish(
                "in",
                Bytes::from_static(
                    br#"{"event_type":"LOGIN","user_id":"u1","timestamp":"2024-03-01T12:00:00"}"#,
                ),
            )
            .await
            .unwrap();
        provider
            .publish("in", Bytes::from_static(br#"{"event_type":"LOGIN","user_id":"u2"}"#))
            .await
            .unwrap();
        provider.close_topic("in").await;

        let clock = ManualClock::new(1_709_294_500_000);
        let dlq = Arc::new(MemoryDlqHandler::default());
        let mut source = adapter(&provider, dlq, &clock).await;

        let first = source.next().await.unwrap().unwrap();
        assert_eq!(first.event.event_time, 1_709_294_400_000);
        assert_eq!(first.origin, "in:1");
        assert_eq!(first.watermark, Some(Watermark(1_709_294_380_000)));
        first.delivery.ack().await.unwrap();

        let second = source.next().await.unwrap().unwrap();
        assert_eq!(second.event.event_time, 1_709_294_500_000, "ingestion time fallback");
        second.delivery.ack().await.unwrap();

        assert!(source.next().await.unwrap().is_none());
        assert_eq!(source.received(), 2);
    }

    #[tokio::test]
    async fn test_non_json_dead_lettered() {
        let provider = MemoryProvider::new();
        provider.publish("in", Bytes::from_static(b"<audit/>")).await.unwrap();
        provider
            .publish("in", Bytes::from_static(br#"{"event_type":"LOGIN","user_id":"u1"}"#))
            .await
            .unwrap();
        provider.close_topic("in").await;

        let clock = ManualClock::new(1_000);
        let dlq = Arc::new(MemoryDlqHandler::default());
        let mut source = adapter(&provider, dlq.clone(), &clock).await;

        let record = source.next().await.unwrap().unwrap();
        assert_eq!(record.event.user_id, "u1");
        record.delivery.ack().await.unwrap();
        assert!(source.next().await.unwrap().is_none());

        assert_eq!(source.dead_lettered(), 1);
        let letters = dlq.list(10).await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, "<audit/>");
        assert_eq!(letters[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_wrong_shape_json_is_not_dead_lettered() {
        let provider = MemoryProvider::new();
        provider
            .publish("in", Bytes::from_static(br#"{"event_type":42}"#))
            .await
            .unwrap();
        provider.close_topic("in").await;

        let clock = ManualClock::new(1_000);
        let dlq = Arc::new(MemoryDlqHandler::default());
        let mut source = adapter(&provider, dlq.clone(), &clock).await;

        let record = source.next().await.unwrap().unwrap();
        assert!(record.event.event_type.is_empty());
        assert_eq!(dlq.count().await.unwrap(), 0);
    }
}
