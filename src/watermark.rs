//! Event-time watermarks
//!
//! A watermark asserts that no further events with an event time at or below
//! it are expected. The source derives watermarks with a bounded
//! out-of-orderness strategy; downstream operators that read from several
//! upstream partitions combine them by taking the minimum.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event-time progress marker in Unix milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark(pub u64);

impl Watermark {
    /// Nothing is known yet
    pub const MIN: Watermark = Watermark(0);

    pub fn millis(&self) -> u64 {
        self.0
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::MIN
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match i64::try_from(self.0).ok().and_then(DateTime::from_timestamp_millis) {
            Some(dt) => write!(f, "Watermark({})", dt.to_rfc3339()),
            None => write!(f, "Watermark({})", self.0),
        }
    }
}

/// Watermark generator tolerating a fixed amount of out-of-orderness
///
/// The watermark trails the highest event time seen by `max_out_of_orderness`
/// and never moves backwards.
#[derive(Debug, Clone)]
pub struct BoundedOutOfOrderness {
    max_out_of_orderness_ms: u64,
    min_advance_ms: u64,
    max_event_time: Option<u64>,
    current: Watermark,
}

impl BoundedOutOfOrderness {
    pub fn new(max_out_of_orderness_ms: u64) -> Self {
        Self {
            max_out_of_orderness_ms,
            min_advance_ms: 0,
            max_event_time: None,
            current: Watermark::MIN,
        }
    }

    /// Only report a new watermark once it has moved at least this far
    pub fn with_min_advance(mut self, min_advance_ms: u64) -> Self {
        self.min_advance_ms = min_advance_ms;
        self
    }

    /// Observe an event time, returning the new watermark if it advanced
    pub fn on_event(&mut self, event_time: u64) -> Option<Watermark> {
        let max = self.max_event_time.map_or(event_time, |m| m.max(event_time));
        self.max_event_time = Some(max);

        let candidate = Watermark(max.saturating_sub(self.max_out_of_orderness_ms));
        let advanced_enough = candidate > self.current
            && (self.current == Watermark::MIN
                || candidate.0 - self.current.0 >= self.min_advance_ms);

        if advanced_enough {
            self.current = candidate;
            tracing::trace!(watermark = %candidate, "Watermark advanced");
            Some(candidate)
        } else {
            None
        }
    }
}

/// Minimum watermark across a fixed set of upstream inputs
#[derive(Debug, Clone)]
pub struct WatermarkCombiner {
    inputs: Vec<Watermark>,
    combined: Watermark,
}

impl WatermarkCombiner {
    pub fn new(inputs: usize) -> Self {
        Self {
            inputs: vec![Watermark::MIN; inputs.max(1)],
            combined: Watermark::MIN,
        }
    }

    /// Record a watermark from one input, returning the combined watermark if it advanced
    pub fn update(&mut self, input: usize, watermark: Watermark) -> Option<Watermark> {
        let slot = self.inputs.get_mut(input)?;
        if watermark <= *slot {
            return None;
        }
        *slot = watermark;

        let min = self.inputs.iter().copied().min().unwrap_or(Watermark::MIN);
        if min > self.combined {
            self.combined = min;
            Some(min)
        } else {
            None
        }
    }
}
