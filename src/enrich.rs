//! Enrichment stage: stateless derivation of processing time, coarse
//! geolocation, and risk score
//!
//! Enrichment never fails the stream. Input that does not have the expected
//! shape comes back as [`Enrichment::PassthroughDegraded`] carrying the
//! original event with the `enriched` marker cleared.

use crate::clock::{SharedClock, SystemClock};
use crate::error::{Result, StreamError};
use crate::types::{EnrichedEvent, Geolocation, RawEvent, ENRICHMENT_VERSION};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Resolves an IP address to a coarse location
///
/// Implementations run inline on the partition task and must not block.
/// A provider backed by a remote service should resolve asynchronously
/// elsewhere and answer from a local cache here.
pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: &str) -> Geolocation;
}

/// Minimal locator that only distinguishes private IPv4 ranges
///
/// `10.0.0.0/8`, `172.16.0.0/12`, and `192.168.0.0/16` resolve to
/// `"Internal"`; everything else is `"Unknown"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrivateRangeLocator;

impl PrivateRangeLocator {
    fn is_private(ip: &Ipv4Addr) -> bool {
        let [a, b, _, _] = ip.octets();
        a == 10 || (a == 172 && (16..=31).contains(&b)) || (a == 192 && b == 168)
    }
}

impl GeoLocator for PrivateRangeLocator {
    fn locate(&self, ip: &str) -> Geolocation {
        let internal = match ip.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => Self::is_private(&v4),
            Ok(IpAddr::V6(v6)) => v6.to_ipv4_mapped().is_some_and(|v4| Self::is_private(&v4)),
            Err(_) => false,
        };
        let country = if internal {
            Geolocation::INTERNAL
        } else {
            Geolocation::UNKNOWN
        };
        Geolocation::new(country, Geolocation::UNKNOWN)
    }
}

/// Base risk per event type plus the external-address surcharge
#[derive(Debug, Clone)]
pub struct RiskTable {
    base: HashMap<String, f64>,
    default_score: f64,
    external_surcharge: f64,
}

impl Default for RiskTable {
    fn default() -> Self {
        let mut base = HashMap::new();
        for name in ["user_authentication", "authentication", "login"] {
            base.insert(name.to_string(), 0.3);
        }
        for name in ["payment_transaction", "payment"] {
            base.insert(name.to_string(), 0.7);
        }
        base.insert("data_access".to_string(), 0.5);

        Self {
            base,
            default_score: 0.2,
            external_surcharge: 0.2,
        }
    }
}

impl RiskTable {
    /// Base score for an event type, ignoring case and `-`/`_` spelling
    pub fn base_score(&self, event_type: &str) -> f64 {
        let normalized = event_type.trim().to_ascii_lowercase().replace('-', "_");
        self.base
            .get(&normalized)
            .copied()
            .unwrap_or(self.default_score)
    }

    /// Final score in `[0, 1]`
    pub fn score(&self, event_type: &str, geolocation: Option<&Geolocation>) -> f64 {
        let mut score = self.base_score(event_type);
        if geolocation.is_some_and(|g| !g.is_internal()) {
            score += self.external_surcharge;
        }
        score.clamp(0.0, 1.0)
    }
}

/// Outcome of enriching one event
#[derive(Debug, Clone, PartialEq)]
pub enum Enrichment {
    /// All derived attributes are present
    Enriched(EnrichedEvent),
    /// The input did not have the expected shape and passes through as-is
    PassthroughDegraded { event: EnrichedEvent, reason: String },
}

impl Enrichment {
    pub fn is_enriched(&self) -> bool {
        matches!(self, Enrichment::Enriched(_))
    }

    /// The event to hand to the next stage, whichever variant this is
    pub fn into_event(self) -> EnrichedEvent {
        match self {
            Enrichment::Enriched(event) => event,
            Enrichment::PassthroughDegraded { event, .. } => event,
        }
    }
}

/// The enrichment stage
#[derive(Clone)]
pub struct Enricher {
    locator: Arc<dyn GeoLocator>,
    risk: RiskTable,
    clock: SharedClock,
}

impl Default for Enricher {
    fn default() -> Self {
        Self::new(Arc::new(PrivateRangeLocator), Arc::new(SystemClock))
    }
}

impl Enricher {
    pub fn new(locator: Arc<dyn GeoLocator>, clock: SharedClock) -> Self {
        Self {
            locator,
            risk: RiskTable::default(),
            clock,
        }
    }

    /// Replace the risk table
    pub fn with_risk_table(mut self, risk: RiskTable) -> Self {
        self.risk = risk;
        self
    }

    /// Enrich an event, degrading instead of failing
    pub fn enrich(&self, raw: RawEvent) -> Enrichment {
        match self.try_enrich(&raw) {
            Ok(event) => Enrichment::Enriched(event),
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    event_type = %raw.event_type,
                    user_id = %raw.user_id,
                    reason = %reason,
                    "Event passed through without enrichment"
                );
                Enrichment::PassthroughDegraded {
                    event: EnrichedEvent::not_enriched(raw),
                    reason,
                }
            }
        }
    }

    /// Enrich an event, reporting malformed input as an error
    pub fn try_enrich(&self, raw: &RawEvent) -> Result<EnrichedEvent> {
        if raw.event_type.is_empty() {
            return Err(StreamError::Malformed("missing event_type".to_string()));
        }

        let geolocation = match raw.metadata.get("ip") {
            None | Some(Value::Null) => None,
            Some(Value::String(ip)) => Some(self.locator.locate(ip)),
            Some(other) => {
                return Err(StreamError::Malformed(format!(
                    "metadata.ip is not a string: {}",
                    other
                )))
            }
        };

        let risk_score = self.risk.score(&raw.event_type, geolocation.as_ref());

        Ok(EnrichedEvent {
            raw: raw.clone(),
            enriched: true,
            processed_time: Some(self.clock.now_millis()),
            enrichment_version: Some(ENRICHMENT_VERSION.to_string()),
            geolocation,
            risk_score: Some(risk_score),
            is_anomaly: false,
            anomaly_score: 0.0,
        })
    }
}
