//! Pipeline configuration
//!
//! Read once at startup from a TOML file. Every field has a default, so a
//! missing file or a partial file is valid. A handful of `AUDIT_STREAM_*`
//! environment variables override the file for container deployments.

use crate::error::{Result, StreamError};
use crate::provider::nats::NatsConfig;
use crate::provider::DeliverPolicy;
use crate::window::{LatePolicy, TimeDomain};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Which bus backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// In-process bus, for tests and local runs
    Memory,
    #[default]
    Nats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub nats: NatsConfig,
}

/// Topic names on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_input_topic")]
    pub input: String,
    #[serde(default = "default_enriched_topic")]
    pub enriched: String,
    #[serde(default = "default_aggregates_topic")]
    pub aggregates: String,
    /// Late-data topic, required by `LatePolicy::SideOutput`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late: Option<String>,
    /// Undecodable input payloads
    #[serde(default = "default_dead_letter_topic")]
    pub dead_letter: String,
    /// Durable consumer name on the input topic
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

fn default_input_topic() -> String {
    "audit-events".to_string()
}

fn default_enriched_topic() -> String {
    "enriched-events".to_string()
}

fn default_aggregates_topic() -> String {
    "event-aggregations".to_string()
}

fn default_dead_letter_topic() -> String {
    "audit-events-dlq".to_string()
}

fn default_consumer_group() -> String {
    "audit-stream-enrichment".to_string()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            input: default_input_topic(),
            enriched: default_enriched_topic(),
            aggregates: default_aggregates_topic(),
            late: None,
            dead_letter: default_dead_letter_topic(),
            consumer_group: default_consumer_group(),
        }
    }
}

/// Input consumption and watermark generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Out-of-orderness tolerated by the watermark generator
    #[serde(default = "default_max_out_of_orderness_ms")]
    pub max_out_of_orderness_ms: u64,
    /// Minimum watermark advance before a new watermark is emitted
    #[serde(default = "default_watermark_interval_ms")]
    pub watermark_interval_ms: u64,
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,
    /// Unacknowledged messages in flight before the bus applies backpressure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ack_pending: Option<i64>,
    /// Redelivery attempts before the bus gives up on a message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_deliver: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait_secs: Option<u64>,
}

fn default_max_out_of_orderness_ms() -> u64 {
    20_000
}

fn default_watermark_interval_ms() -> u64 {
    200
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            max_out_of_orderness_ms: default_max_out_of_orderness_ms(),
            watermark_interval_ms: default_watermark_interval_ms(),
            deliver_policy: DeliverPolicy::default(),
            max_ack_pending: None,
            max_deliver: None,
            ack_wait_secs: None,
        }
    }
}

/// Tumbling-window aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_width_ms")]
    pub width_ms: u64,
    #[serde(default)]
    pub offset_ms: u64,
    #[serde(default)]
    pub time_domain: TimeDomain,
    #[serde(default)]
    pub late_policy: LatePolicy,
    /// Processing-time timer resolution
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_width_ms() -> u64 {
    60_000
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width_ms: default_width_ms(),
            offset_ms: 0,
            time_domain: TimeDomain::default(),
            late_policy: LatePolicy::default(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl WindowConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Burst anomaly detection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Events a key must have seen (this one included) before it is judged
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    /// Flag when the current gap is below this fraction of the mean gap
    #[serde(default = "default_burst_ratio_threshold")]
    pub burst_ratio_threshold: f64,
}

fn default_min_samples() -> u64 {
    3
}

fn default_burst_ratio_threshold() -> f64 {
    0.1
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            burst_ratio_threshold: default_burst_ratio_threshold(),
        }
    }
}

/// Output publishing and retry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Retry attempts after the first failure (0 = no retries)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap for exponential growth
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-attempt publish timeout, acknowledgement included
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

impl SinkConfig {
    /// Backoff before retry number `attempt` (0-indexed)
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`, with ±25%
    /// deterministic jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(10));
        let capped = exp_delay.min(self.max_delay_ms);

        let jitter_range = capped / 4;
        let delay = if jitter_range > 0 {
            let jitter_offset = (attempt as u64 * 7 + 3) % (jitter_range * 2 + 1);
            capped - jitter_range + jitter_offset
        } else {
            capped
        };

        Duration::from_millis(delay)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Partitioning and state persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Detector partitions, keyed by `event_type:user_id`
    #[serde(default = "default_detector_partitions")]
    pub detector_partitions: usize,
    /// Aggregator partitions, keyed by `event_type`
    #[serde(default = "default_aggregator_partitions")]
    pub aggregator_partitions: usize,
    /// Bounded queue length between stages
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Directory for detector checkpoints; none disables checkpointing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
}

fn default_detector_partitions() -> usize {
    4
}

fn default_aggregator_partitions() -> usize {
    2
}

fn default_channel_capacity() -> usize {
    1_024
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            detector_partitions: default_detector_partitions(),
            aggregator_partitions: default_aggregator_partitions(),
            channel_capacity: default_channel_capacity(),
            checkpoint_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Fallback filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| StreamError::Config(format!("Invalid config: {}", e)))
    }

    /// Apply `AUDIT_STREAM_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `AUDIT_STREAM_*` overrides from an arbitrary lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("AUDIT_STREAM_BUS_PROVIDER") {
            self.bus.provider = match v.to_ascii_lowercase().as_str() {
                "memory" => ProviderKind::Memory,
                "nats" => ProviderKind::Nats,
                other => {
                    return Err(StreamError::Config(format!(
                        "AUDIT_STREAM_BUS_PROVIDER: unknown provider '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(v) = lookup("AUDIT_STREAM_NATS_URL") {
            self.bus.nats.url = v;
        }
        if let Some(v) = lookup("AUDIT_STREAM_INPUT_TOPIC") {
            self.topics.input = v;
        }
        if let Some(v) = lookup("AUDIT_STREAM_CONSUMER_GROUP") {
            self.topics.consumer_group = v;
        }
        if let Some(v) = lookup("AUDIT_STREAM_WINDOW_WIDTH_MS") {
            self.window.width_ms = parse_env("AUDIT_STREAM_WINDOW_WIDTH_MS", &v)?;
        }
        if let Some(v) = lookup("AUDIT_STREAM_TIME_DOMAIN") {
            self.window.time_domain = match v.to_ascii_lowercase().as_str() {
                "processing_time" => TimeDomain::ProcessingTime,
                "event_time" => TimeDomain::EventTime,
                other => {
                    return Err(StreamError::Config(format!(
                        "AUDIT_STREAM_TIME_DOMAIN: unknown time domain '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(v) = lookup("AUDIT_STREAM_DETECTOR_PARTITIONS") {
            self.runtime.detector_partitions = parse_env("AUDIT_STREAM_DETECTOR_PARTITIONS", &v)?;
        }
        if let Some(v) = lookup("AUDIT_STREAM_AGGREGATOR_PARTITIONS") {
            self.runtime.aggregator_partitions =
                parse_env("AUDIT_STREAM_AGGREGATOR_PARTITIONS", &v)?;
        }
        if let Some(v) = lookup("AUDIT_STREAM_CHECKPOINT_DIR") {
            self.runtime.checkpoint_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("AUDIT_STREAM_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = lookup("AUDIT_STREAM_LOG_JSON") {
            self.log.json = parse_env("AUDIT_STREAM_LOG_JSON", &v)?;
        }
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(StreamError::Config(msg.to_string()));

        if self.window.width_ms == 0 {
            return fail("window.width_ms must be positive");
        }
        if self.window.tick_interval_ms == 0 {
            return fail("window.tick_interval_ms must be positive");
        }
        if self.window.late_policy == LatePolicy::SideOutput && self.topics.late.is_none() {
            return fail("window.late_policy = side_output requires topics.late");
        }
        if self.detector.min_samples < 3 {
            return fail("detector.min_samples must be at least 3");
        }
        if !self.detector.burst_ratio_threshold.is_finite()
            || self.detector.burst_ratio_threshold <= 0.0
        {
            return fail("detector.burst_ratio_threshold must be a positive number");
        }
        if self.runtime.detector_partitions == 0 || self.runtime.aggregator_partitions == 0 {
            return fail("runtime partitions must be positive");
        }
        if self.runtime.channel_capacity == 0 {
            return fail("runtime.channel_capacity must be positive");
        }
        if self.sink.publish_timeout_ms == 0 {
            return fail("sink.publish_timeout_ms must be positive");
        }
        if self.sink.base_delay_ms > self.sink.max_delay_ms {
            return fail("sink.base_delay_ms must not exceed sink.max_delay_ms");
        }
        for (name, topic) in [
            ("topics.input", &self.topics.input),
            ("topics.enriched", &self.topics.enriched),
            ("topics.aggregates", &self.topics.aggregates),
            ("topics.dead_letter", &self.topics.dead_letter),
            ("topics.consumer_group", &self.topics.consumer_group),
        ] {
            if topic.trim().is_empty() {
                return Err(StreamError::Config(format!("{} must not be empty", name)));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| StreamError::Config(format!("{}: invalid value '{}': {}", key, value, e)))
}
