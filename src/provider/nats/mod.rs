//! NATS JetStream provider
//!
//! Implements `EventProvider` on a single JetStream stream. Each pipeline
//! topic is a subject under the configured prefix; consumers are durable pull
//! consumers with explicit acknowledgement.

mod client;
mod config;
mod subscriber;

pub use client::{NatsClient, StreamInfo};
pub use config::{NatsConfig, StorageType};
pub use subscriber::NatsSubscription;

use crate::error::Result;
use crate::provider::{EventProvider, ProviderInfo, PublishOptions, SubscribeOptions, Subscription};
use async_trait::async_trait;
use bytes::Bytes;

/// NATS JetStream provider
pub struct NatsProvider {
    client: NatsClient,
}

impl NatsProvider {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl EventProvider for NatsProvider {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<u64> {
        self.client
            .publish(topic, payload, &PublishOptions::default())
            .await
    }

    async fn publish_with_options(
        &self,
        topic: &str,
        payload: Bytes,
        opts: &PublishOptions,
    ) -> Result<u64> {
        self.client.publish(topic, payload, opts).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        consumer_name: &str,
        opts: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>> {
        let sub = self.client.subscribe(topic, consumer_name, opts).await?;
        Ok(Box::new(sub))
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let info = self.client.stream_info().await?;
        Ok(ProviderInfo {
            provider: "nats".to_string(),
            messages: info.messages,
            bytes: info.bytes,
            consumers: info.consumer_count,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}
