//! Per-(key, window) accumulator and lifecycle

use super::assigner::Window;
use crate::types::{AggregationResult, EnrichedEvent};
use std::collections::HashSet;
use std::fmt;

/// Lifecycle of one (event type, window) pair
///
/// `Open → Closing → Emitted → Discarded`. Any other transition is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Accepting events
    Open,
    /// Progress passed the window end; no more events accepted
    Closing,
    /// Result produced
    Emitted,
    /// Accumulator released
    Discarded,
}

impl WindowState {
    fn can_become(self, next: WindowState) -> bool {
        matches!(
            (self, next),
            (WindowState::Open, WindowState::Closing)
                | (WindowState::Closing, WindowState::Emitted)
                | (WindowState::Emitted, WindowState::Discarded)
        )
    }
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WindowState::Open => "open",
            WindowState::Closing => "closing",
            WindowState::Emitted => "emitted",
            WindowState::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// Running totals for one (event type, window)
#[derive(Debug, Clone, Default)]
pub struct WindowAccumulator {
    pub count: u64,
    pub anomaly_count: u64,
    pub sum_risk_score: f64,
    pub distinct_user_ids: HashSet<String>,
}

impl WindowAccumulator {
    pub fn add(&mut self, event: &EnrichedEvent) {
        self.count += 1;
        if event.is_anomaly {
            self.anomaly_count += 1;
        }
        self.sum_risk_score += event.risk_score.unwrap_or(0.0);
        if !event.user_id().is_empty() {
            self.distinct_user_ids.insert(event.user_id().to_string());
        }
    }

    /// Derive the published summary
    pub fn finalize(&self, event_type: &str, window: Window) -> AggregationResult {
        let avg_risk_score = if self.count == 0 {
            0.0
        } else {
            self.sum_risk_score / self.count as f64
        };
        AggregationResult {
            event_type: event_type.to_string(),
            time_bucket_start: window.start,
            time_bucket_end: window.end,
            count: self.count,
            avg_risk_score,
            anomaly_count: self.anomaly_count,
            unique_users: self.distinct_user_ids.len() as u64,
        }
    }
}

/// One (event type, window) slot owned by an aggregator partition
#[derive(Debug)]
pub struct WindowSlot {
    event_type: String,
    window: Window,
    state: WindowState,
    acc: WindowAccumulator,
}

impl WindowSlot {
    pub fn open(event_type: impl Into<String>, window: Window) -> Self {
        Self {
            event_type: event_type.into(),
            window,
            state: WindowState::Open,
            acc: WindowAccumulator::default(),
        }
    }

    #[cfg(test)]
    fn state(&self) -> WindowState {
        self.state
    }

    pub fn add(&mut self, event: &EnrichedEvent) -> Result<(), String> {
        if self.state != WindowState::Open {
            return Err(format!(
                "event added to {} window {}@{}",
                self.state, self.event_type, self.window.start
            ));
        }
        self.acc.add(event);
        Ok(())
    }

    fn transition(&mut self, next: WindowState) -> Result<(), String> {
        if !self.state.can_become(next) {
            return Err(format!(
                "window {}@{} cannot go from {} to {}",
                self.event_type, self.window.start, self.state, next
            ));
        }
        self.state = next;
        Ok(())
    }

    /// Drive the slot through closing and emission
    ///
    /// Returns `None` for a window that never received an event.
    pub fn close(&mut self) -> Result<Option<AggregationResult>, String> {
        self.transition(WindowState::Closing)?;
        let result = (self.acc.count > 0).then(|| self.acc.finalize(&self.event_type, self.window));
        self.transition(WindowState::Emitted)?;
        Ok(result)
    }

    /// Release the accumulator after emission
    pub fn discard(&mut self) -> Result<(), String> {
        self.transition(WindowState::Discarded)?;
        self.acc = WindowAccumulator::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawEvent;

    fn event(user: &str, risk: f64, anomaly: bool) -> EnrichedEvent {
        let mut e = EnrichedEvent::not_enriched(RawEvent::new("LOGIN", user, "login", 0));
        e.risk_score = Some(risk);
        e.is_anomaly = anomaly;
        e
    }

    const W: Window = Window {
        start: 60_000,
        end: 120_000,
    };

    #[test]
    fn test_accumulator_finalize() {
        let mut acc = WindowAccumulator::default();
        acc.add(&event("u1", 0.3, false));
        acc.add(&event("u1", 0.3, false));
        acc.add(&event("u2", 0.3, false));

        let r = acc.finalize("LOGIN", W);
        assert_eq!(r.event_type, "LOGIN");
        assert_eq!(r.time_bucket_start, 60_000);
        assert_eq!(r.time_bucket_end, 120_000);
        assert_eq!(r.count, 3);
        assert!((r.avg_risk_score - 0.3).abs() < 1e-9);
        assert_eq!(r.anomaly_count, 0);
        assert_eq!(r.unique_users, 2);
    }

    #[test]
    fn test_missing_risk_counts_as_zero() {
        let mut acc = WindowAccumulator::default();
        acc.add(&event("u1", 0.8, true));
        let mut degraded = event("u2", 0.0, false);
        degraded.risk_score = None;
        acc.add(&degraded);

        let r = acc.finalize("LOGIN", W);
        assert_eq!(r.count, 2);
        assert!((r.avg_risk_score - 0.4).abs() < 1e-9);
        assert_eq!(r.anomaly_count, 1);
    }

    #[test]
    fn test_slot_lifecycle() {
        let mut slot = WindowSlot::open("LOGIN", W);
        assert_eq!(slot.state(), WindowState::Open);
        slot.add(&event("u1", 0.3, false)).unwrap();

        let result = slot.close().unwrap().unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(slot.state(), WindowState::Emitted);

        slot.discard().unwrap();
        assert_eq!(slot.state(), WindowState::Discarded);
    }

    #[test]
    fn test_slot_rejects_illegal_transitions() {
        let mut slot = WindowSlot::open("LOGIN", W);
        assert!(slot.discard().is_err());

        slot.add(&event("u1", 0.3, false)).unwrap();
        slot.close().unwrap();
        assert!(slot.close().is_err(), "at most one finalize per window");
        assert!(slot.add(&event("u1", 0.3, false)).is_err());
    }

    #[test]
    fn test_empty_slot_emits_nothing() {
        let mut slot = WindowSlot::open("LOGIN", W);
        assert_eq!(slot.close().unwrap(), None);
    }
}
