//! Core record types flowing through the pipeline
//!
//! Field names are snake_case to match the upstream audit producer's wire
//! format. All timestamps are Unix milliseconds.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Version tag stamped on every successfully enriched event
pub const ENRICHMENT_VERSION: &str = "1.0";

/// A raw audit event as published by the upstream collector
///
/// Immutable once received. Unknown fields are kept in `extra` and written
/// back out unchanged on the enriched stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event category (e.g., "USER_AUTHENTICATION")
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_type: String,

    /// Acting user
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,

    /// Free-form action description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,

    /// Arbitrary producer metadata (`ip` is used for geolocation)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    /// Event time in Unix milliseconds (0 = not yet resolved)
    #[serde(default)]
    pub event_time: u64,

    /// Fields this crate does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawEvent {
    /// Create an event with the given identity fields and no metadata
    pub fn new(
        event_type: impl Into<String>,
        user_id: impl Into<String>,
        action: impl Into<String>,
        event_time: u64,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            user_id: user_id.into(),
            action: action.into(),
            event_time,
            ..Default::default()
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Decode a bus payload
    ///
    /// Fails only when the payload is not JSON at all. A JSON value that does
    /// not fit the expected shape still yields an event (with empty identity
    /// fields) so it can travel the degraded path.
    pub fn from_slice(payload: &[u8]) -> crate::Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        Ok(Self::from_value(value))
    }

    /// Lenient conversion from an already-parsed JSON value
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => match serde_json::from_value::<RawEvent>(Value::Object(map.clone())) {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!(error = %e, "Raw event has unexpected field types");
                    Self {
                        extra: map,
                        ..Default::default()
                    }
                }
            },
            other => {
                let mut extra = Map::new();
                extra.insert("payload".to_string(), other);
                Self {
                    extra,
                    ..Default::default()
                }
            }
        }
    }

    /// Whether both partition key components are present
    pub fn has_identity(&self) -> bool {
        !self.event_type.is_empty() && !self.user_id.is_empty()
    }

    /// Event time declared by the producer, if any
    ///
    /// Prefers the numeric `event_time` field, then the producer's
    /// `timestamp` field (ISO-8601, with or without offset, or epoch millis).
    pub fn declared_event_time(&self) -> Option<u64> {
        if self.event_time > 0 {
            return Some(self.event_time);
        }
        match self.extra.get("timestamp")? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => parse_timestamp(s),
            _ => None,
        }
    }
}

fn parse_timestamp(s: &str) -> Option<u64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return u64::try_from(dt.timestamp_millis()).ok();
    }
    // Python's datetime.isoformat() on a naive UTC value
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    u64::try_from(naive.and_utc().timestamp_millis()).ok()
}

/// Coarse location derived from an IP address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geolocation {
    pub country: String,
    pub city: String,
}

impl Geolocation {
    /// Country value used for private address ranges
    pub const INTERNAL: &'static str = "Internal";
    /// Placeholder for anything that could not be resolved
    pub const UNKNOWN: &'static str = "Unknown";

    pub fn new(country: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            city: city.into(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.country == Self::INTERNAL
    }
}

/// A raw event plus the attributes derived by the pipeline
///
/// When `enriched` is false the event went through the degraded path and the
/// enrichment attributes are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedEvent {
    #[serde(flatten)]
    pub raw: RawEvent,

    /// Whether the enrichment stage succeeded
    pub enriched: bool,

    /// Wall-clock processing time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_time: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geolocation: Option<Geolocation>,

    /// Risk in `[0, 1]`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,

    #[serde(default)]
    pub is_anomaly: bool,

    /// Anomaly score in `[0, 1]`
    #[serde(default)]
    pub anomaly_score: f64,
}

impl EnrichedEvent {
    /// Wrap a raw event without any enrichment
    pub fn not_enriched(raw: RawEvent) -> Self {
        Self {
            raw,
            enriched: false,
            processed_time: None,
            enrichment_version: None,
            geolocation: None,
            risk_score: None,
            is_anomaly: false,
            anomaly_score: 0.0,
        }
    }

    /// Copy of this event with the anomaly verdict applied
    pub fn with_anomaly(&self, is_anomaly: bool, anomaly_score: f64) -> Self {
        Self {
            is_anomaly,
            anomaly_score,
            ..self.clone()
        }
    }

    pub fn event_type(&self) -> &str {
        &self.raw.event_type
    }

    pub fn user_id(&self) -> &str {
        &self.raw.user_id
    }

    /// Composite partition key for the anomaly detector (`event_type:user_id`)
    pub fn detector_key(&self) -> Option<String> {
        if self.raw.has_identity() {
            Some(format!("{}:{}", self.raw.event_type, self.raw.user_id))
        } else {
            None
        }
    }
}

/// Summary of one event type over one closed window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub event_type: String,
    /// Inclusive window start
    pub time_bucket_start: u64,
    /// Exclusive window end
    pub time_bucket_end: u64,
    pub count: u64,
    pub avg_risk_score: f64,
    pub anomaly_count: u64,
    pub unique_users: u64,
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_event_decode() {
        let json = r#"{
            "id": 42,
            "event_type": "USER_AUTHENTICATION",
            "user_id": "u1",
            "action": "login",
            "timestamp": "2024-03-01T12:00:00.250000",
            "ipfs_hash": "Qm123",
            "metadata": {"ip": "10.0.0.7"}
        }"#;

        let event = RawEvent::from_slice(json.as_bytes()).unwrap();
        assert_eq!(event.event_type, "USER_AUTHENTICATION");
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.metadata["ip"], "10.0.0.7");
        assert_eq!(event.extra["id"], 42);
        assert_eq!(event.extra["ipfs_hash"], "Qm123");
        assert_eq!(event.event_time, 0);
        assert_eq!(event.declared_event_time(), Some(1_709_294_400_250));
    }

    #[test]
    fn test_raw_event_rfc3339_and_numeric_timestamps() {
        let event = RawEvent::from_value(serde_json::json!({
            "event_type": "DATA_ACCESS",
            "user_id": "u2",
            "timestamp": "2024-03-01T13:00:00+01:00"
        }));
        assert_eq!(event.declared_event_time(), Some(1_709_294_400_000));

        let event = RawEvent::from_value(serde_json::json!({
            "event_type": "DATA_ACCESS",
            "timestamp": 1_700_000_000_000u64
        }));
        assert_eq!(event.declared_event_time(), Some(1_700_000_000_000));

        let event = RawEvent::new("DATA_ACCESS", "u2", "read", 5);
        assert_eq!(event.declared_event_time(), Some(5));
    }

    #[test]
    fn test_raw_event_wrong_field_types_are_preserved() {
        let event = RawEvent::from_value(serde_json::json!({
            "event_type": 17,
            "user_id": "u1",
        }));

        assert!(event.event_type.is_empty());
        assert!(!event.has_identity());
        assert_eq!(event.extra["event_type"], 17);

        // No duplicate keys on re-serialization
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], 17);
        assert_eq!(json["user_id"], "u1");
    }

    #[test]
    fn test_raw_event_non_object_payload() {
        let event = RawEvent::from_slice(b"[1,2,3]").unwrap();
        assert!(!event.has_identity());
        assert_eq!(event.extra["payload"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_raw_event_rejects_non_json() {
        assert!(RawEvent::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_enriched_event_serialization_flattens_raw() {
        let raw = RawEvent::new("PAYMENT_TRANSACTION", "u9", "pay", 1000)
            .with_metadata("ip", "8.8.8.8");
        let event = EnrichedEvent {
            raw,
            enriched: true,
            processed_time: Some(2000),
            enrichment_version: Some(ENRICHMENT_VERSION.to_string()),
            geolocation: Some(Geolocation::new("Unknown", "Unknown")),
            risk_score: Some(0.9),
            is_anomaly: false,
            anomaly_score: 0.0,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "PAYMENT_TRANSACTION");
        assert_eq!(json["metadata"]["ip"], "8.8.8.8");
        assert_eq!(json["geolocation"]["country"], "Unknown");
        assert_eq!(json["enrichment_version"], "1.0");
        assert_eq!(json["risk_score"], 0.9);
        assert_eq!(json["is_anomaly"], false);
    }

    #[test]
    fn test_not_enriched_omits_enrichment_fields() {
        let event = EnrichedEvent::not_enriched(RawEvent::new("", "u1", "x", 1));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["enriched"], false);
        assert!(json.get("processed_time").is_none());
        assert!(json.get("geolocation").is_none());
        assert!(json.get("risk_score").is_none());
        assert_eq!(json["anomaly_score"], 0.0);
    }

    #[test]
    fn test_detector_key() {
        let event = EnrichedEvent::not_enriched(RawEvent::new("LOGIN", "u1", "login", 1));
        assert_eq!(event.detector_key().as_deref(), Some("LOGIN:u1"));

        let event = EnrichedEvent::not_enriched(RawEvent::new("LOGIN", "", "login", 1));
        assert!(event.detector_key().is_none());
    }

    #[test]
    fn test_with_anomaly_leaves_input_untouched() {
        let event = EnrichedEvent::not_enriched(RawEvent::new("LOGIN", "u1", "login", 1));
        let flagged = event.with_anomaly(true, 0.9);
        assert!(flagged.is_anomaly);
        assert_eq!(flagged.anomaly_score, 0.9);
        assert!(!event.is_anomaly);
    }
}
