//! NATS connection and JetStream stream configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// NATS provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Server URL (default: nats://127.0.0.1:4222)
    #[serde(default = "default_url")]
    pub url: String,

    /// Optional auth token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// JetStream stream holding every pipeline topic
    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    /// Subject prefix; topic `t` maps to subject `{prefix}.{t}`
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    #[serde(default)]
    pub storage: StorageType,

    /// Stream message limit (-1 = unlimited)
    #[serde(default = "default_unlimited")]
    pub max_events: i64,

    /// Stream byte limit (-1 = unlimited)
    #[serde(default = "default_unlimited")]
    pub max_bytes: i64,

    /// Message retention in seconds (0 = forever)
    #[serde(default)]
    pub max_age_secs: u64,

    /// Window in which JetStream drops duplicate `Nats-Msg-Id`s (seconds)
    #[serde(default = "default_duplicate_window_secs")]
    pub duplicate_window_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_stream_name() -> String {
    "AUDIT_STREAM".to_string()
}

fn default_subject_prefix() -> String {
    "audit".to_string()
}

fn default_unlimited() -> i64 {
    -1
}

fn default_duplicate_window_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: None,
            stream_name: default_stream_name(),
            subject_prefix: default_subject_prefix(),
            storage: StorageType::default(),
            max_events: default_unlimited(),
            max_bytes: default_unlimited(),
            max_age_secs: 0,
            duplicate_window_secs: default_duplicate_window_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl NatsConfig {
    /// Subject carrying a pipeline topic
    pub fn subject_for(&self, topic: &str) -> String {
        format!("{}.{}", self.subject_prefix, topic)
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }

    /// Topic name carried by a subject, if it belongs to this stream
    pub fn topic_of<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject
            .strip_prefix(self.subject_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://127.0.0.1:4222");
        assert_eq!(config.stream_name, "AUDIT_STREAM");
        assert_eq!(config.storage, StorageType::File);
        assert_eq!(config.max_events, -1);
    }

    #[test]
    fn test_subjects() {
        let config = NatsConfig::default();
        assert_eq!(config.subject_for("audit-events"), "audit.audit-events");
        assert_eq!(config.stream_subjects(), vec!["audit.>".to_string()]);
        assert_eq!(config.topic_of("audit.enriched-events"), Some("enriched-events"));
        assert_eq!(config.topic_of("other.enriched-events"), None);
        assert_eq!(config.topic_of("auditx.y"), None);
    }

    #[test]
    fn test_partial_toml() {
        let config: NatsConfig = toml::from_str(
            r#"
            url = "nats://bus:4222"
            storage = "memory"
            "#,
        )
        .unwrap();
        assert_eq!(config.url, "nats://bus:4222");
        assert_eq!(config.storage, StorageType::Memory);
        assert_eq!(config.subject_prefix, "audit");
    }
}
