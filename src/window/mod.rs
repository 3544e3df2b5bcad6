//! Tumbling-window aggregation per event type
//!
//! Each aggregator partition owns the windows of the event types routed to
//! it. Windows are driven by an explicit progress signal rather than
//! callbacks: timer ticks in processing time, watermarks in event time.
//! Every window passes through [`WindowState`] exactly once and emits at most
//! one [`AggregationResult`]; windows that saw no events emit nothing.

mod assigner;
mod state;

pub use assigner::{TimeDomain, TumblingWindows, Window, WindowAssigner};
pub use state::{WindowAccumulator, WindowSlot, WindowState};

use crate::clock::{SharedClock, SystemClock};
use crate::error::{Result, StreamError};
use crate::types::{AggregationResult, EnrichedEvent};
use crate::watermark::Watermark;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// What happens to an event whose window already closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatePolicy {
    /// Count it, log it, and drop it
    #[default]
    Drop,
    /// Hand it back to the caller for the late-data topic
    SideOutput,
}

/// Result of offering an event to the aggregator
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Added to an open window
    Accepted,
    /// Cannot be grouped (no event type)
    Skipped,
    /// Window already closed and the policy is `Drop`
    DroppedLate,
    /// Window already closed and the policy is `SideOutput`
    Late(EnrichedEvent),
}

/// Windowed aggregator owning the state of one partition
pub struct WindowAggregator {
    partition: usize,
    assigner: Box<dyn WindowAssigner>,
    domain: TimeDomain,
    late_policy: LatePolicy,
    clock: SharedClock,
    /// Keyed by (window end, event type) so due windows form a prefix
    windows: BTreeMap<(u64, String), WindowSlot>,
    /// Every window ending at or before this instant is closed
    closed_through: u64,
    late_events: u64,
}

impl WindowAggregator {
    pub fn new(assigner: impl WindowAssigner + 'static, domain: TimeDomain) -> Self {
        Self::with_clock(0, assigner, domain, Arc::new(SystemClock))
    }

    pub fn with_clock(
        partition: usize,
        assigner: impl WindowAssigner + 'static,
        domain: TimeDomain,
        clock: SharedClock,
    ) -> Self {
        Self {
            partition,
            assigner: Box::new(assigner),
            domain,
            late_policy: LatePolicy::default(),
            clock,
            windows: BTreeMap::new(),
            closed_through: 0,
            late_events: 0,
        }
    }

    pub fn with_late_policy(mut self, policy: LatePolicy) -> Self {
        self.late_policy = policy;
        self
    }

    /// Offer an enriched event to its window
    pub fn add(&mut self, event: EnrichedEvent) -> Result<Admission> {
        if event.event_type().is_empty() {
            return Ok(Admission::Skipped);
        }

        let ts = match self.domain {
            TimeDomain::ProcessingTime => self.clock.now_millis(),
            TimeDomain::EventTime => event.raw.event_time,
        };
        let window = self.assigner.assign(ts);

        if window.end <= self.closed_through {
            self.late_events += 1;
            tracing::debug!(
                partition = self.partition,
                event_type = %event.event_type(),
                window_start = window.start,
                closed_through = self.closed_through,
                policy = ?self.late_policy,
                "Late event"
            );
            return Ok(match self.late_policy {
                LatePolicy::Drop => Admission::DroppedLate,
                LatePolicy::SideOutput => Admission::Late(event),
            });
        }

        let key = (window.end, event.event_type().to_string());
        let slot = self
            .windows
            .entry(key)
            .or_insert_with(|| WindowSlot::open(event.event_type(), window));
        slot.add(&event).map_err(|reason| self.corruption(reason))?;
        Ok(Admission::Accepted)
    }

    /// Processing-time timer tick
    pub fn on_timer(&mut self, now: u64) -> Result<Vec<AggregationResult>> {
        match self.domain {
            TimeDomain::ProcessingTime => self.advance_to(now),
            TimeDomain::EventTime => Ok(Vec::new()),
        }
    }

    /// Event-time watermark
    pub fn on_watermark(&mut self, watermark: Watermark) -> Result<Vec<AggregationResult>> {
        match self.domain {
            TimeDomain::EventTime => self.advance_to(watermark.millis()),
            TimeDomain::ProcessingTime => Ok(Vec::new()),
        }
    }

    /// Close every window ending at or before `progress`
    pub fn advance_to(&mut self, progress: u64) -> Result<Vec<AggregationResult>> {
        if progress <= self.closed_through {
            return Ok(Vec::new());
        }
        self.closed_through = progress;

        let remaining = self.windows.split_off(&(progress.saturating_add(1), String::new()));
        let due = std::mem::replace(&mut self.windows, remaining);
        self.close_all(due)
    }

    /// Close every open window regardless of progress (graceful shutdown)
    pub fn flush(&mut self) -> Result<Vec<AggregationResult>> {
        let due = std::mem::take(&mut self.windows);
        if let Some(((end, _), _)) = due.iter().next_back() {
            self.closed_through = self.closed_through.max(*end);
        }
        self.close_all(due)
    }

    fn close_all(&mut self, due: BTreeMap<(u64, String), WindowSlot>) -> Result<Vec<AggregationResult>> {
        let mut results = Vec::with_capacity(due.len());
        for (_, mut slot) in due {
            let emitted = slot.close().map_err(|reason| self.corruption(reason))?;
            slot.discard().map_err(|reason| self.corruption(reason))?;
            if let Some(result) = emitted {
                tracing::debug!(
                    partition = self.partition,
                    event_type = %result.event_type,
                    window_start = result.time_bucket_start,
                    count = result.count,
                    "Window emitted"
                );
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Drop all windows after a state corruption
    pub fn reset(&mut self) {
        tracing::warn!(
            partition = self.partition,
            dropped_windows = self.windows.len(),
            "Aggregator state reset"
        );
        self.windows.clear();
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    /// Events that arrived after their window closed
    pub fn late_events(&self) -> u64 {
        self.late_events
    }

    fn corruption(&self, reason: String) -> StreamError {
        StreamError::StateCorruption {
            partition: self.partition,
            reason,
        }
    }
}
