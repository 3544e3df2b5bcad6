//! Window assignment

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open time interval `[start, end)` in Unix milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    pub start: u64,
    pub end: u64,
}

/// Which clock drives window assignment and closing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeDomain {
    /// Assign by arrival at the aggregator, close on timer ticks
    #[default]
    ProcessingTime,
    /// Assign by the event's declared time, close on watermarks
    EventTime,
}

/// Maps a timestamp to the window it belongs to
pub trait WindowAssigner: Send + Sync + fmt::Debug {
    fn assign(&self, timestamp: u64) -> Window;
}

/// Fixed-size, non-overlapping windows aligned to the epoch plus an offset
#[derive(Debug, Clone, Copy)]
pub struct TumblingWindows {
    size_ms: u64,
    offset_ms: u64,
}

impl TumblingWindows {
    /// # Panics
    /// If `size_ms` is zero. Configuration validation rejects that earlier.
    pub fn new(size_ms: u64) -> Self {
        assert!(size_ms > 0, "Window size must be positive");
        Self {
            size_ms,
            offset_ms: 0,
        }
    }

    pub fn with_offset(mut self, offset_ms: u64) -> Self {
        self.offset_ms = offset_ms % self.size_ms;
        self
    }
}

impl WindowAssigner for TumblingWindows {
    fn assign(&self, timestamp: u64) -> Window {
        if timestamp < self.offset_ms {
            // Partial window before the first aligned boundary
            return Window {
                start: 0,
                end: self.offset_ms,
            };
        }
        let start = timestamp - (timestamp - self.offset_ms) % self.size_ms;
        Window {
            start,
            end: start.saturating_add(self.size_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tumbling_assignment() {
        let tw = TumblingWindows::new(60_000);
        assert_eq!(tw.assign(0), Window { start: 0, end: 60_000 });
        assert_eq!(tw.assign(59_999), Window { start: 0, end: 60_000 });
        assert_eq!(tw.assign(60_000), Window { start: 60_000, end: 120_000 });
        assert_eq!(tw.assign(125_500), Window { start: 120_000, end: 180_000 });
    }

    #[test]
    fn test_tumbling_with_offset() {
        let tw = TumblingWindows::new(10_000).with_offset(2_500);
        assert_eq!(tw.assign(2_500), Window { start: 2_500, end: 12_500 });
        assert_eq!(tw.assign(12_499), Window { start: 2_500, end: 12_500 });
        assert_eq!(tw.assign(12_500), Window { start: 12_500, end: 22_500 });
        assert_eq!(tw.assign(1_000), Window { start: 0, end: 2_500 });
    }

    #[test]
    #[should_panic(expected = "Window size must be positive")]
    fn test_zero_size_rejected() {
        TumblingWindows::new(0);
    }

    #[test]
    fn test_time_domain_serde() {
        let json = serde_json::to_string(&TimeDomain::EventTime).unwrap();
        assert_eq!(json, "\"event_time\"");
        let parsed: TimeDomain = serde_json::from_str("\"processing_time\"").unwrap();
        assert_eq!(parsed, TimeDomain::ProcessingTime);
    }
}
