//! Sink adapter: publish with retry, backoff, and timeout
//!
//! Every logical record carries a message id that stays the same across
//! retries, so a deduplicating bus keeps one copy even when an attempt timed
//! out after the bus had already accepted it.

use crate::config::SinkConfig;
use crate::error::{Result, StreamError};
use crate::provider::{EventProvider, PublishOptions};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

/// A serialized record bound for an output topic
#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub topic: String,
    pub msg_id: String,
    pub payload: Bytes,
}

impl SinkRecord {
    pub fn json<T: Serialize>(
        topic: impl Into<String>,
        msg_id: impl Into<String>,
        value: &T,
    ) -> Result<Self> {
        Ok(Self {
            topic: topic.into(),
            msg_id: msg_id.into(),
            payload: Bytes::from(serde_json::to_vec(value)?),
        })
    }
}

#[derive(Clone)]
pub struct SinkAdapter {
    provider: Arc<dyn EventProvider>,
    config: SinkConfig,
}

impl SinkAdapter {
    pub fn new(provider: Arc<dyn EventProvider>, config: SinkConfig) -> Self {
        Self { provider, config }
    }

    /// Publish a record, retrying transient failures
    ///
    /// Returns `DeliveryExhausted` once `max_retries` retries have failed.
    /// Non-transient errors are returned immediately.
    pub async fn deliver(&self, record: &SinkRecord) -> Result<u64> {
        let timeout = self.config.publish_timeout();
        let opts = PublishOptions {
            msg_id: Some(record.msg_id.clone()),
            timeout: Some(timeout),
        };

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(
                timeout,
                self.provider
                    .publish_with_options(&record.topic, record.payload.clone(), &opts),
            )
            .await
            .unwrap_or_else(|_| {
                Err(StreamError::Timeout(format!(
                    "Publish to '{}' timed out after {:?}",
                    record.topic, timeout
                )))
            });

            match outcome {
                Ok(sequence) => {
                    if attempt > 0 {
                        tracing::info!(
                            topic = %record.topic,
                            msg_id = %record.msg_id,
                            retries = attempt,
                            "Publish succeeded after retries"
                        );
                    }
                    return Ok(sequence);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.config.max_retries => {
                    tracing::error!(
                        topic = %record.topic,
                        msg_id = %record.msg_id,
                        attempts = attempt + 1,
                        error = %e,
                        "Publish retries exhausted"
                    );
                    return Err(StreamError::DeliveryExhausted {
                        topic: record.topic.clone(),
                        attempts: attempt + 1,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.config.delay_for_attempt(attempt);
                    tracing::warn!(
                        topic = %record.topic,
                        msg_id = %record.msg_id,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::{ProviderInfo, SubscribeOptions, Subscription};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` publishes, then delegates
    struct FlakyProvider {
        inner: MemoryProvider,
        failures: u32,
        calls: AtomicU32,
        hang: bool,
    }

    #[async_trait]
    impl EventProvider for FlakyProvider {
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64> {
            self.publish_with_options(topic, payload, &PublishOptions::default())
                .await
        }

        async fn publish_with_options(
            &self,
            topic: &str,
            payload: Bytes,
            opts: &PublishOptions,
        ) -> Result<u64> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.hang {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                return Err(StreamError::Publish {
                    topic: topic.to_string(),
                    reason: "broker unavailable".to_string(),
                });
            }
            self.inner.publish_with_options(topic, payload, opts).await
        }

        async fn subscribe(
            &self,
            topic: &str,
            consumer_name: &str,
            opts: &SubscribeOptions,
        ) -> Result<Box<dyn Subscription>> {
            self.inner.subscribe(topic, consumer_name, opts).await
        }

        async fn info(&self) -> Result<ProviderInfo> {
            self.inner.info().await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn fast_config(max_retries: u32) -> SinkConfig {
        SinkConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 4,
            publish_timeout_ms: 50,
        }
    }

    fn flaky(failures: u32, hang: bool) -> Arc<FlakyProvider> {
        Arc::new(FlakyProvider {
            inner: MemoryProvider::new(),
            failures,
            calls: AtomicU32::new(0),
            hang,
        })
    }

    fn record() -> SinkRecord {
        SinkRecord::json("out", "rec-1", &serde_json::json!({"count": 3})).unwrap()
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let provider = flaky(2, false);
        let sink = SinkAdapter::new(provider.clone(), fast_config(3));

        sink.deliver(&record()).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        let published = provider.inner.messages("out").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].msg_id.as_deref(), Some("rec-1"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_fatal() {
        let provider = flaky(10, false);
        let sink = SinkAdapter::new(provider.clone(), fast_config(2));

        let err = sink.deliver(&record()).await.unwrap_err();
        match err {
            StreamError::DeliveryExhausted { topic, attempts, .. } => {
                assert_eq!(topic, "out");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeouts_are_retried() {
        let provider = flaky(1, true);
        let sink = SinkAdapter::new(provider.clone(), fast_config(1));

        sink.deliver(&record()).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_retries_when_disabled() {
        let provider = flaky(1, false);
        let sink = SinkAdapter::new(provider.clone(), fast_config(0));

        assert!(matches!(
            sink.deliver(&record()).await,
            Err(StreamError::DeliveryExhausted { attempts: 1, .. })
        ));
    }
}
