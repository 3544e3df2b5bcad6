//! Burst anomaly detection over per-key inter-arrival statistics
//!
//! Each `event_type:user_id` key keeps a running count, the arrival time of
//! its latest event, and the running mean of inter-arrival gaps. An event that
//! arrives much sooner than the key's historical pace is flagged.
//!
//! Arrival time is processing time read from the detector's [`Clock`], not the
//! event's declared time.

use crate::clock::{SharedClock, SystemClock};
use crate::config::DetectorConfig;
use crate::error::{Result, StreamError};
use crate::types::EnrichedEvent;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Running statistics for one detector key
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyStats {
    pub event_count: u64,
    pub last_event_time: u64,
    pub avg_inter_arrival_ms: f64,
}

impl KeyStats {
    fn first(now: u64) -> Self {
        Self {
            event_count: 1,
            last_event_time: now,
            avg_inter_arrival_ms: 0.0,
        }
    }

    /// Fold a new arrival into the statistics
    ///
    /// Returns the gap since the previous arrival and the mean gap as it
    /// stood before this arrival.
    fn record(&mut self, now: u64) -> (u64, f64) {
        let since_last = now.saturating_sub(self.last_event_time);
        let historical = self.avg_inter_arrival_ms;
        let intervals = self.event_count.saturating_sub(1) as f64;

        self.avg_inter_arrival_ms = (historical * intervals + since_last as f64) / (intervals + 1.0);
        self.event_count += 1;
        self.last_event_time = self.last_event_time.max(now);

        (since_last, historical)
    }

    fn check(&self) -> std::result::Result<(), String> {
        if self.event_count == 0 {
            return Err("event_count is zero after update".to_string());
        }
        if !self.avg_inter_arrival_ms.is_finite() || self.avg_inter_arrival_ms < 0.0 {
            return Err(format!(
                "avg_inter_arrival_ms is {}",
                self.avg_inter_arrival_ms
            ));
        }
        Ok(())
    }
}

/// Anomaly decision for a single event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub is_anomaly: bool,
    pub score: f64,
}

impl Verdict {
    /// Verdict for keys with too little history
    pub const NONE: Verdict = Verdict {
        is_anomaly: false,
        score: 0.0,
    };

    /// Judge a gap against the historical mean gap
    ///
    /// A zero mean yields the maximal score instead of dividing by zero.
    pub fn judge(since_last_ms: u64, avg_inter_arrival_ms: f64, burst_threshold: f64) -> Self {
        let since = since_last_ms as f64;
        let is_anomaly = since < burst_threshold * avg_inter_arrival_ms;
        let score = if avg_inter_arrival_ms > 0.0 {
            score_for_ratio(since / avg_inter_arrival_ms)
        } else {
            0.9
        };
        Self { is_anomaly, score }
    }
}

/// Tiered score for a burst ratio (latest gap / mean gap)
pub fn score_for_ratio(ratio: f64) -> f64 {
    if ratio < 0.1 {
        0.9
    } else if ratio < 0.3 {
        0.7
    } else if ratio < 0.5 {
        0.5
    } else {
        0.1
    }
}

/// Keyed anomaly detector owning the state of one partition
///
/// Not shared between tasks; the pipeline gives each partition its own.
pub struct AnomalyDetector {
    partition: usize,
    config: DetectorConfig,
    clock: SharedClock,
    stats: HashMap<String, KeyStats>,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self::with_clock(0, config, Arc::new(SystemClock))
    }

    pub fn with_clock(partition: usize, config: DetectorConfig, clock: SharedClock) -> Self {
        Self {
            partition,
            config,
            clock,
            stats: HashMap::new(),
        }
    }

    /// Produce a copy of `event` carrying the anomaly verdict
    ///
    /// Events without `event_type` or `user_id` pass through with the anomaly
    /// fields defaulted. A state invariant violation resets this partition's
    /// state and the event gets the default verdict.
    pub fn detect(&mut self, event: &EnrichedEvent) -> EnrichedEvent {
        let Some(key) = event.detector_key() else {
            tracing::debug!(partition = self.partition, "Event without detector key passed through");
            return event.with_anomaly(false, 0.0);
        };

        match self.observe(&key) {
            Ok(verdict) => event.with_anomaly(verdict.is_anomaly, verdict.score),
            Err(e) => {
                tracing::error!(
                    partition = self.partition,
                    key = %key,
                    error = %e,
                    keys_dropped = self.stats.len(),
                    "Detector state reset"
                );
                self.stats.clear();
                event.with_anomaly(false, 0.0)
            }
        }
    }

    fn observe(&mut self, key: &str) -> Result<Verdict> {
        let now = self.clock.now_millis();

        let Some(stats) = self.stats.get_mut(key) else {
            self.stats.insert(key.to_string(), KeyStats::first(now));
            return Ok(Verdict::NONE);
        };

        let ordinal = stats.event_count + 1;
        let (since_last, historical) = stats.record(now);
        stats.check().map_err(|reason| StreamError::StateCorruption {
            partition: self.partition,
            reason: format!("{}: {}", key, reason),
        })?;

        if ordinal < self.config.min_samples {
            return Ok(Verdict::NONE);
        }

        let verdict = Verdict::judge(since_last, historical, self.config.burst_ratio_threshold);
        if verdict.is_anomaly {
            tracing::info!(
                partition = self.partition,
                key = %key,
                since_last_ms = since_last,
                avg_inter_arrival_ms = historical,
                score = verdict.score,
                "Burst anomaly detected"
            );
        }
        Ok(verdict)
    }

    /// Number of keys tracked by this partition
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Replace the partition state with a checkpoint
    ///
    /// Entries that fail the invariant check are skipped.
    pub fn restore(&mut self, state: HashMap<String, KeyStats>) {
        self.stats = state
            .into_iter()
            .filter(|(key, stats)| match stats.check() {
                Ok(()) => true,
                Err(reason) => {
                    tracing::warn!(partition = self.partition, key = %key, reason = %reason, "Skipping corrupt checkpoint entry");
                    false
                }
            })
            .collect();
    }

    /// Consume the detector, returning its per-key state for checkpointing
    pub fn into_state(self) -> HashMap<String, KeyStats> {
        self.stats
    }

    #[cfg(test)]
    fn stats_for(&self, key: &str) -> Option<&KeyStats> {
        self.stats.get(key)
    }

    #[cfg(test)]
    fn corrupt(&mut self, key: &str) {
        if let Some(stats) = self.stats.get_mut(key) {
            stats.avg_inter_arrival_ms = f64::NAN;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::RawEvent;

    fn detector(clock: &ManualClock) -> AnomalyDetector {
        AnomalyDetector::with_clock(0, DetectorConfig::default(), Arc::new(clock.clone()))
    }

    fn event(event_type: &str, user: &str) -> EnrichedEvent {
        EnrichedEvent::not_enriched(RawEvent::new(event_type, user, "act", 0))
    }

    #[test]
    fn test_burst_after_regular_pace_is_flagged() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);
        let login = event("LOGIN", "u1");

        let first = det.detect(&login);
        clock.set(1_000);
        let second = det.detect(&login);
        clock.set(1_010);
        let third = det.detect(&login);

        assert!(!first.is_anomaly);
        assert_eq!(first.anomaly_score, 0.0);
        assert!(!second.is_anomaly);
        assert_eq!(second.anomaly_score, 0.0);
        assert!(third.is_anomaly);
        assert_eq!(third.anomaly_score, 0.9);
    }

    #[test]
    fn test_fewer_than_three_events_never_flagged() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);

        for user in ["a", "b", "c"] {
            let e = event("LOGIN", user);
            let r1 = det.detect(&e);
            let r2 = det.detect(&e);
            for r in [r1, r2] {
                assert!(!r.is_anomaly);
                assert_eq!(r.anomaly_score, 0.0);
            }
        }
    }

    #[test]
    fn test_steady_pace_scores_low() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);
        let e = event("DATA_ACCESS", "u1");

        let mut last = None;
        for i in 0..6 {
            clock.set(i * 1_000);
            last = Some(det.detect(&e));
        }
        let last = last.unwrap();
        assert!(!last.is_anomaly);
        assert_eq!(last.anomaly_score, 0.1);
    }

    #[test]
    fn test_score_tiers() {
        assert_eq!(score_for_ratio(0.05), 0.9);
        assert_eq!(score_for_ratio(0.1), 0.7);
        assert_eq!(score_for_ratio(0.29), 0.7);
        assert_eq!(score_for_ratio(0.3), 0.5);
        assert_eq!(score_for_ratio(0.49), 0.5);
        assert_eq!(score_for_ratio(0.5), 0.1);
        assert_eq!(score_for_ratio(4.0), 0.1);
    }

    #[test]
    fn test_moderate_burst_scored_but_not_flagged() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);
        let e = event("LOGIN", "u1");

        det.detect(&e);
        clock.set(1_000);
        det.detect(&e);
        clock.set(1_200); // ratio 0.2
        let r = det.detect(&e);
        assert!(!r.is_anomaly);
        assert_eq!(r.anomaly_score, 0.7);
    }

    #[test]
    fn test_zero_average_does_not_divide_by_zero() {
        let clock = ManualClock::new(500);
        let mut det = detector(&clock);
        let e = event("LOGIN", "u1");

        det.detect(&e);
        det.detect(&e);
        let r = det.detect(&e);
        assert_eq!(r.anomaly_score, 0.9);
        assert!(r.anomaly_score.is_finite());
        assert!(!r.is_anomaly);
    }

    #[test]
    fn test_running_mean_and_count() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);
        let e = event("LOGIN", "u1");

        for t in [0, 1_000, 3_000, 6_000] {
            clock.set(t);
            det.detect(&e);
        }
        let stats = det.stats_for("LOGIN:u1").unwrap();
        assert_eq!(stats.event_count, 4);
        assert_eq!(stats.last_event_time, 6_000);
        assert!((stats.avg_inter_arrival_ms - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_keys_are_independent() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);

        det.detect(&event("LOGIN", "u1"));
        det.detect(&event("LOGIN", "u2"));
        det.detect(&event("PAYMENT", "u1"));
        assert_eq!(det.len(), 3);
        assert_eq!(det.stats_for("LOGIN:u1").unwrap().event_count, 1);
    }

    #[test]
    fn test_missing_identity_passes_through() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);
        let mut e = event("LOGIN", "");
        e.is_anomaly = true;
        e.anomaly_score = 0.5;

        let r = det.detect(&e);
        assert!(!r.is_anomaly);
        assert_eq!(r.anomaly_score, 0.0);
        assert!(det.is_empty());
    }

    #[test]
    fn test_only_anomaly_fields_change() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);
        let mut e = event("LOGIN", "u1");
        e.risk_score = Some(0.3);
        e.processed_time = Some(77);

        let r = det.detect(&e);
        assert_eq!(r.raw, e.raw);
        assert_eq!(r.risk_score, Some(0.3));
        assert_eq!(r.processed_time, Some(77));
    }

    #[test]
    fn test_corruption_resets_partition() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);
        let e = event("LOGIN", "u1");
        det.detect(&e);
        det.detect(&event("LOGIN", "u2"));
        det.corrupt("LOGIN:u1");

        clock.set(100);
        let r = det.detect(&e);
        assert!(!r.is_anomaly);
        assert_eq!(r.anomaly_score, 0.0);
        assert!(det.is_empty());

        // Partition keeps working after the reset
        det.detect(&e);
        assert_eq!(det.stats_for("LOGIN:u1").unwrap().event_count, 1);
    }

    #[test]
    fn test_into_state_restore() {
        let clock = ManualClock::new(0);
        let mut det = detector(&clock);
        let e = event("LOGIN", "u1");
        det.detect(&e);
        clock.set(1_000);
        det.detect(&e);

        let mut state = det.into_state();
        state.insert(
            "BAD:key".to_string(),
            KeyStats {
                event_count: 0,
                last_event_time: 0,
                avg_inter_arrival_ms: 0.0,
            },
        );

        let mut restored = detector(&clock);
        restored.restore(state);
        assert_eq!(restored.len(), 1);

        // History carries over: the third event is judged immediately
        clock.set(1_010);
        let r = restored.detect(&e);
        assert!(r.is_anomaly);
        assert_eq!(r.anomaly_score, 0.9);
    }

    #[test]
    fn test_custom_threshold() {
        let clock = ManualClock::new(0);
        let config = DetectorConfig {
            min_samples: 3,
            burst_ratio_threshold: 0.5,
        };
        let mut det = AnomalyDetector::with_clock(0, config, Arc::new(clock.clone()));
        let e = event("LOGIN", "u1");

        det.detect(&e);
        clock.set(1_000);
        det.detect(&e);
        clock.set(1_400); // ratio 0.4
        let r = det.detect(&e);
        assert!(r.is_anomaly);
        assert_eq!(r.anomaly_score, 0.5);
    }
}
