//! NATS JetStream client: connect, publish, subscribe

use super::config::{NatsConfig, StorageType};
use super::subscriber::NatsSubscription;
use crate::error::{Result, StreamError};
use crate::provider::{DeliverPolicy, PublishOptions, SubscribeOptions};
use async_nats::jetstream;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// Manages the connection and the lifecycle of the single stream that
/// carries every pipeline topic.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// JetStream stream handle (Mutex for methods requiring &mut self)
    stream: Mutex<jetstream::stream::Stream>,

    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS and initialize the JetStream stream
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| StreamError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: Mutex::new(stream),
            config: Arc::new(config),
        })
    }

    /// Publish a payload, returning the JetStream sequence number
    ///
    /// A message id is sent as `Nats-Msg-Id` so the stream drops duplicates
    /// within its duplicate window.
    pub async fn publish(&self, topic: &str, payload: Bytes, opts: &PublishOptions) -> Result<u64> {
        let subject = self.config.subject_for(topic);
        let publish_err = |reason: String| StreamError::Publish {
            topic: topic.to_string(),
            reason,
        };

        let ack_fut = match opts.msg_id {
            Some(ref msg_id) => {
                let mut headers = async_nats::HeaderMap::new();
                headers.insert("Nats-Msg-Id", msg_id.as_str());
                self.jetstream
                    .publish_with_headers(subject.clone(), headers, payload)
                    .await
            }
            None => self.jetstream.publish(subject.clone(), payload).await,
        }
        .map_err(|e| publish_err(e.to_string()))?;

        let ack = match opts.timeout {
            Some(timeout) => tokio::time::timeout(timeout, ack_fut).await.map_err(|_| {
                StreamError::Timeout(format!(
                    "Publish ack timed out after {:?} for topic '{}'",
                    timeout, topic
                ))
            })?,
            None => ack_fut.await,
        }
        .map_err(|e| publish_err(format!("ack failed: {}", e)))?;

        tracing::trace!(
            subject = %subject,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            msg_id = ?opts.msg_id,
            "Message published"
        );

        Ok(ack.sequence)
    }

    /// Create or resume a durable pull consumer on a topic
    pub async fn subscribe(
        &self,
        topic: &str,
        consumer_name: &str,
        opts: &SubscribeOptions,
    ) -> Result<NatsSubscription> {
        let filter_subject = self.config.subject_for(topic);
        let config = build_consumer_config(&filter_subject, consumer_name, opts);

        let consumer = self
            .stream
            .lock()
            .await
            .get_or_create_consumer(consumer_name, config)
            .await
            .map_err(|e| {
                StreamError::Consumer(format!(
                    "Failed to create durable consumer '{}': {}",
                    consumer_name, e
                ))
            })?;

        let messages = consumer.messages().await.map_err(|e| StreamError::Subscribe {
            topic: topic.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            consumer = consumer_name,
            filter = %filter_subject,
            max_deliver = ?opts.max_deliver,
            max_ack_pending = ?opts.max_ack_pending,
            "Durable subscription created"
        );

        Ok(NatsSubscription::new(messages, self.config.clone()))
    }

    /// Get stream info
    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self.stream.lock().await;
        let info = stream
            .info()
            .await
            .map_err(|e| StreamError::Stream(format!("Failed to get stream info: {}", e)))?;

        Ok(StreamInfo {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        })
    }

    /// Delete a durable consumer
    pub async fn delete_consumer(&self, consumer_name: &str) -> Result<()> {
        self.stream
            .lock()
            .await
            .delete_consumer(consumer_name)
            .await
            .map_err(|e| {
                StreamError::Consumer(format!(
                    "Failed to delete consumer '{}': {}",
                    consumer_name, e
                ))
            })?;

        tracing::info!(consumer = consumer_name, "Consumer deleted");
        Ok(())
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Summary of stream state
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub consumer_count: usize,
}

/// Build a durable JetStream pull consumer config
fn build_consumer_config(
    filter_subject: &str,
    durable_name: &str,
    opts: &SubscribeOptions,
) -> jetstream::consumer::pull::Config {
    let deliver_policy = match &opts.deliver_policy {
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::ByStartSequence { sequence } => {
            jetstream::consumer::DeliverPolicy::ByStartSequence {
                start_sequence: *sequence,
            }
        }
        DeliverPolicy::ByStartTime { timestamp } => {
            let secs = *timestamp / 1000;
            let nanos = ((*timestamp % 1000) * 1_000_000) as i64;
            let start_time = time::OffsetDateTime::from_unix_timestamp(secs as i64)
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
                + time::Duration::nanoseconds(nanos);
            jetstream::consumer::DeliverPolicy::ByStartTime { start_time }
        }
    };

    jetstream::consumer::pull::Config {
        durable_name: Some(durable_name.to_string()),
        filter_subject: filter_subject.to_string(),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy,
        max_deliver: opts.max_deliver.unwrap_or(0),
        max_ack_pending: opts.max_ack_pending.unwrap_or(0),
        ack_wait: opts.ack_wait.unwrap_or_default(),
        ..Default::default()
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream exists with the configured limits
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_messages: config.max_events,
        max_age: Duration::from_secs(config.max_age_secs),
        max_bytes: config.max_bytes,
        duplicate_window: Duration::from_secs(config.duplicate_window_secs),
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| {
            StreamError::Stream(format!(
                "Failed to create/get stream '{}': {}",
                config.stream_name, e
            ))
        })?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "JetStream stream ready"
    );

    Ok(stream)
}
