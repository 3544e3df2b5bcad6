//! Partitioned streaming runtime
//!
//! ```text
//!             ┌─ detector 0 ─┐          ┌─ aggregator 0 ─┐
//! source ─────┼─ detector 1 ─┼──────────┼─ aggregator 1 ─┼── aggregates sink
//!  (hash of   └─ detector n ─┘ (hash of └────────────────┘
//!  type:user)        │          type)
//!                    └───────────────────────────────────── enriched sink
//! ```
//!
//! Every partition is one tokio task owning its state; stages talk over
//! bounded channels only. Watermarks travel in-band behind the events, and
//! each aggregator combines the watermarks of all detector partitions.
//! Only the source and the two sink tasks touch the bus.
//!
//! An input message travels with its enriched event and is acknowledged by
//! the enriched sink once that record is published. When a stage fails, the
//! messages it still holds are nak'd so the bus redelivers them.

use crate::anomaly::AnomalyDetector;
use crate::checkpoint::{
    load_blocking, save_blocking, CheckpointStore, DetectorState, FileCheckpointStore,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::PipelineConfig;
use crate::dlq::{BusDlqHandler, DlqHandler};
use crate::enrich::Enricher;
use crate::error::{Result, StreamError};
use crate::provider::{EventProvider, PendingMessage, SubscribeOptions};
use crate::sink::{SinkAdapter, SinkRecord};
use crate::source::{SourceAdapter, SourceRecord};
use crate::types::{AggregationResult, EnrichedEvent, RawEvent};
use crate::watermark::{BoundedOutOfOrderness, Watermark, WatermarkCombiner};
use crate::window::{Admission, LatePolicy, TumblingWindows, WindowAggregator};
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

enum DetectorInput {
    Event {
        raw: RawEvent,
        origin: String,
        delivery: PendingMessage,
    },
    Watermark(Watermark),
}

enum AggregatorInput {
    Event { event: EnrichedEvent, origin: String },
    Watermark { upstream: usize, watermark: Watermark },
}

/// Counters reported when the pipeline stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Messages pulled from the input topic
    pub received: u64,
    pub dead_lettered: u64,
    /// Events that took the degraded enrichment path
    pub degraded: u64,
    pub anomalies: u64,
    pub enriched_published: u64,
    /// Aggregation results and late side-output records
    pub aggregates_published: u64,
    pub windows_emitted: u64,
    pub late_events: u64,
}

/// A record for a sink task and the input message it settles
struct Outbound {
    record: SinkRecord,
    delivery: Option<PendingMessage>,
}

impl From<SinkRecord> for Outbound {
    fn from(record: SinkRecord) -> Self {
        Self {
            record,
            delivery: None,
        }
    }
}

#[derive(Default)]
struct DetectorReport {
    degraded: u64,
    anomalies: u64,
}

/// What a detector partition hands back when it stops
struct DetectorExit {
    report: DetectorReport,
    state: DetectorState,
    result: Result<()>,
}

#[derive(Default)]
struct AggregatorReport {
    windows_emitted: u64,
    late_events: u64,
}

/// The audit stream processor
pub struct Pipeline {
    config: PipelineConfig,
    provider: Arc<dyn EventProvider>,
    dlq: Option<Arc<dyn DlqHandler>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    enricher: Option<Enricher>,
    clock: SharedClock,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, provider: Arc<dyn EventProvider>) -> Self {
        let checkpoints = config
            .runtime
            .checkpoint_dir
            .as_ref()
            .map(|dir| Arc::new(FileCheckpointStore::new(dir)) as Arc<dyn CheckpointStore>);
        Self {
            config,
            provider,
            dlq: None,
            checkpoints,
            enricher: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the dead letter handler (default: publish to `topics.dead_letter`)
    pub fn with_dlq(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Clock used by enrichment, detection, and processing-time windows
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Run until the input ends, `shutdown` resolves, or a stage fails
    ///
    /// On a clean stop every partition drains, detector state is
    /// checkpointed, and every open window is flushed before returning.
    pub async fn run<F>(self, shutdown: F) -> Result<PipelineReport>
    where
        F: Future<Output = ()> + Send,
    {
        self.config.validate()?;
        let Pipeline {
            config,
            provider,
            dlq,
            checkpoints,
            enricher,
            clock,
        } = self;

        let runtime = &config.runtime;
        let topics = Arc::new(config.topics.clone());
        let fatal = Arc::new(Notify::new());
        let enricher = enricher.unwrap_or_else(|| {
            Enricher::new(Arc::new(crate::enrich::PrivateRangeLocator), clock.clone())
        });

        // Sinks
        let sink = SinkAdapter::new(provider.clone(), config.sink.clone());
        let dlq = dlq.unwrap_or_else(|| {
            Arc::new(BusDlqHandler::new(sink.clone(), topics.dead_letter.clone()))
                as Arc<dyn DlqHandler>
        });
        let (enriched_tx, enriched_rx) = mpsc::channel(runtime.channel_capacity);
        let (aggregates_tx, aggregates_rx) = mpsc::channel(runtime.channel_capacity);
        let enriched_sink = tokio::spawn(run_sink(
            "enriched",
            sink.clone(),
            enriched_rx,
            fatal.clone(),
        ));
        let aggregates_sink = tokio::spawn(run_sink(
            "aggregates",
            sink,
            aggregates_rx,
            fatal.clone(),
        ));

        // Aggregators
        let mut aggregator_txs = Vec::with_capacity(runtime.aggregator_partitions);
        let mut aggregators: Vec<JoinHandle<Result<AggregatorReport>>> = Vec::new();
        for partition in 0..runtime.aggregator_partitions {
            let (tx, rx) = mpsc::channel(runtime.channel_capacity);
            aggregator_txs.push(tx);
            let assigner =
                TumblingWindows::new(config.window.width_ms).with_offset(config.window.offset_ms);
            let aggregator = WindowAggregator::with_clock(
                partition,
                assigner,
                config.window.time_domain,
                clock.clone(),
            )
            .with_late_policy(config.window.late_policy);
            let task = AggregatorTask {
                partition,
                aggregator,
                combiner: WatermarkCombiner::new(runtime.detector_partitions),
                output: aggregates_tx.clone(),
                aggregates_topic: topics.aggregates.clone(),
                late_topic: topics.late.clone(),
                clock: clock.clone(),
                report: AggregatorReport::default(),
            };
            aggregators.push(tokio::spawn(task.run(rx, config.window.tick_interval())));
        }
        drop(aggregates_tx);

        // Detectors
        let mut restored = match &checkpoints {
            Some(store) => restore_partitions(store.clone(), runtime.detector_partitions).await,
            None => Vec::new(),
        };
        restored.resize_with(runtime.detector_partitions, DetectorState::new);

        let mut detector_txs = Vec::with_capacity(runtime.detector_partitions);
        let mut detectors: Vec<JoinHandle<DetectorExit>> = Vec::new();
        for (partition, state) in restored.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(runtime.channel_capacity);
            detector_txs.push(tx);
            let mut detector =
                AnomalyDetector::with_clock(partition, config.detector, clock.clone());
            detector.restore(state);
            tracing::debug!(partition, keys = detector.len(), "Detector partition started");
            let task = DetectorTask {
                partition,
                enricher: enricher.clone(),
                detector,
                enriched: enriched_tx.clone(),
                aggregators: aggregator_txs.clone(),
                enriched_topic: topics.enriched.clone(),
                report: DetectorReport::default(),
            };
            detectors.push(tokio::spawn(task.run(rx)));
        }
        drop(enriched_tx);
        drop(aggregator_txs);

        // Source
        let opts = SubscribeOptions {
            deliver_policy: config.source.deliver_policy.clone(),
            max_deliver: config.source.max_deliver,
            max_ack_pending: config.source.max_ack_pending,
            ack_wait: config.source.ack_wait_secs.map(Duration::from_secs),
        };
        let source_result = match provider
            .subscribe(&topics.input, &topics.consumer_group, &opts)
            .await
        {
            Ok(subscription) => {
                let watermarks = BoundedOutOfOrderness::new(config.source.max_out_of_orderness_ms)
                    .with_min_advance(config.source.watermark_interval_ms);
                let source = SourceAdapter::new(subscription, dlq, watermarks, clock.clone());
                tracing::info!(
                    provider = provider.name(),
                    input = %topics.input,
                    consumer = %topics.consumer_group,
                    detector_partitions = runtime.detector_partitions,
                    aggregator_partitions = runtime.aggregator_partitions,
                    time_domain = ?config.window.time_domain,
                    "Pipeline started"
                );
                run_source(source, detector_txs, shutdown, fatal).await
            }
            Err(e) => {
                drop(detector_txs);
                Err(e)
            }
        };

        // Drain in topology order; sink failures are the root cause when present
        let mut report = PipelineReport::default();
        let mut first_error: Option<StreamError> = None;

        // None once a partition's state is lost
        let mut detector_state = Some(DetectorState::new());
        for handle in detectors {
            match handle.await {
                Ok(exit) => {
                    report.degraded += exit.report.degraded;
                    report.anomalies += exit.report.anomalies;
                    if let Some(state) = detector_state.as_mut() {
                        state.extend(exit.state);
                    }
                    if let Err(e) = exit.result {
                        record_error(&mut first_error, e);
                    }
                }
                Err(e) => {
                    detector_state = None;
                    record_error(
                        &mut first_error,
                        StreamError::StageClosed(format!("detector task: {}", e)),
                    );
                }
            }
        }
        if let Some(store) = &checkpoints {
            checkpoint(store.clone(), detector_state).await;
        }
        for handle in aggregators {
            match join(handle, "aggregator").await {
                Ok(r) => {
                    report.windows_emitted += r.windows_emitted;
                    report.late_events += r.late_events;
                }
                Err(e) => record_error(&mut first_error, e),
            }
        }
        let mut sink_error: Option<StreamError> = None;
        match join(enriched_sink, "enriched sink").await {
            Ok(n) => report.enriched_published = n,
            Err(e) => record_error(&mut sink_error, e),
        }
        match join(aggregates_sink, "aggregates sink").await {
            Ok(n) => report.aggregates_published = n,
            Err(e) => record_error(&mut sink_error, e),
        }

        match source_result {
            Ok((received, dead_lettered)) => {
                report.received = received;
                report.dead_lettered = dead_lettered;
            }
            Err(e) => record_error(&mut first_error, e),
        }

        match sink_error.or(first_error) {
            Some(e) => {
                tracing::error!(error = %e, "Pipeline failed");
                Err(e)
            }
            None => {
                tracing::info!(?report, "Pipeline stopped");
                Ok(report)
            }
        }
    }
}

/// Keep the first error, preferring anything over a closed-channel symptom
fn record_error(slot: &mut Option<StreamError>, e: StreamError) {
    match slot {
        None | Some(StreamError::StageClosed(_)) if !matches!(e, StreamError::StageClosed(_)) => {
            *slot = Some(e)
        }
        None => *slot = Some(e),
        _ => {}
    }
}

async fn join<T>(handle: JoinHandle<Result<T>>, stage: &str) -> Result<T> {
    handle
        .await
        .map_err(|e| StreamError::StageClosed(format!("{} task: {}", stage, e)))?
}

/// Load the detector checkpoint and route every key to its partition
async fn restore_partitions(store: Arc<dyn CheckpointStore>, partitions: usize) -> Vec<DetectorState> {
    let mut restored: Vec<DetectorState> = (0..partitions).map(|_| DetectorState::new()).collect();
    match load_blocking(store).await {
        Ok(state) => {
            let keys = state.len();
            for (key, stats) in state {
                let target = partition_for(&key, partitions);
                restored[target].insert(key, stats);
            }
            tracing::info!(keys, partitions, "Detector state restored");
        }
        Err(e) => tracing::error!(error = %e, "Checkpoint unusable, starting empty"),
    }
    restored
}

async fn checkpoint(store: Arc<dyn CheckpointStore>, state: Option<DetectorState>) {
    let Some(state) = state else {
        tracing::warn!("Detector state incomplete, keeping the previous checkpoint");
        return;
    };
    let keys = state.len();
    match save_blocking(store, state).await {
        Ok(()) => tracing::info!(keys, "Detector state checkpointed"),
        Err(e) => tracing::error!(error = %e, "Checkpoint failed"),
    }
}

/// Return unsettled input messages to the bus for redelivery
async fn nak_all(deliveries: impl IntoIterator<Item = PendingMessage>) {
    for delivery in deliveries {
        let sequence = delivery.message.sequence;
        if let Err(e) = delivery.nak().await {
            tracing::warn!(sequence, error = %e, "Failed to nak message");
        }
    }
}

/// Stable partition index for a key
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

async fn run_source<F>(
    mut source: SourceAdapter,
    detectors: Vec<mpsc::Sender<DetectorInput>>,
    shutdown: F,
    fatal: Arc<Notify>,
) -> Result<(u64, u64)>
where
    F: Future<Output = ()> + Send,
{
    let mut shutdown = std::pin::pin!(shutdown);
    let result = loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("Shutdown requested, stopping source");
                break Ok(());
            }
            _ = fatal.notified() => {
                tracing::warn!("Downstream failure, stopping source");
                break Ok(());
            }
            next = source.next() => next,
        };

        match next {
            Ok(Some(record)) => {
                if let Err(e) = hand_off(record, &detectors).await {
                    break Err(e);
                }
            }
            Ok(None) => {
                tracing::info!("Input ended");
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    // Closing the detector channels starts the drain
    drop(detectors);
    result.map(|()| (source.received(), source.dead_lettered()))
}

async fn hand_off(record: SourceRecord, detectors: &[mpsc::Sender<DetectorInput>]) -> Result<()> {
    let SourceRecord {
        event,
        origin,
        watermark,
        delivery,
    } = record;

    let key = format!("{}:{}", event.event_type, event.user_id);
    let target = partition_for(&key, detectors.len());
    let input = DetectorInput::Event {
        raw: event,
        origin,
        delivery,
    };
    if let Err(mpsc::error::SendError(input)) = detectors[target].send(input).await {
        if let DetectorInput::Event { delivery, .. } = input {
            nak_all([delivery]).await;
        }
        return Err(StreamError::StageClosed(format!("detector {}", target)));
    }

    if let Some(watermark) = watermark {
        for (partition, tx) in detectors.iter().enumerate() {
            tx.send(DetectorInput::Watermark(watermark))
                .await
                .map_err(|_| StreamError::StageClosed(format!("detector {}", partition)))?;
        }
    }
    Ok(())
}

struct DetectorTask {
    partition: usize,
    enricher: Enricher,
    detector: AnomalyDetector,
    enriched: mpsc::Sender<Outbound>,
    aggregators: Vec<mpsc::Sender<AggregatorInput>>,
    enriched_topic: String,
    report: DetectorReport,
}

impl DetectorTask {
    async fn run(mut self, mut rx: mpsc::Receiver<DetectorInput>) -> DetectorExit {
        let result = self.consume(&mut rx).await;
        if result.is_err() {
            rx.close();
            let mut unsettled = Vec::new();
            while let Some(input) = rx.recv().await {
                if let DetectorInput::Event { delivery, .. } = input {
                    unsettled.push(delivery);
                }
            }
            tracing::debug!(partition = self.partition, naked = unsettled.len(), "Detector stopped early");
            nak_all(unsettled).await;
        } else {
            tracing::debug!(partition = self.partition, "Detector drained");
        }

        DetectorExit {
            report: self.report,
            state: self.detector.into_state(),
            result,
        }
    }

    async fn consume(&mut self, rx: &mut mpsc::Receiver<DetectorInput>) -> Result<()> {
        while let Some(input) = rx.recv().await {
            match input {
                DetectorInput::Event {
                    raw,
                    origin,
                    delivery,
                } => self.process(raw, origin, delivery).await?,
                DetectorInput::Watermark(watermark) => {
                    for (target, tx) in self.aggregators.iter().enumerate() {
                        tx.send(AggregatorInput::Watermark {
                            upstream: self.partition,
                            watermark,
                        })
                        .await
                        .map_err(|_| StreamError::StageClosed(format!("aggregator {}", target)))?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn process(&mut self, raw: RawEvent, origin: String, delivery: PendingMessage) -> Result<()> {
        let enrichment = self.enricher.enrich(raw);
        if !enrichment.is_enriched() {
            self.report.degraded += 1;
        }
        let event = self.detector.detect(&enrichment.into_event());
        if event.is_anomaly {
            self.report.anomalies += 1;
        }

        let record = match SinkRecord::json(&self.enriched_topic, format!("enriched:{}", origin), &event) {
            Ok(record) => record,
            Err(e) => {
                nak_all([delivery]).await;
                return Err(e);
            }
        };
        let outbound = Outbound {
            record,
            delivery: Some(delivery),
        };
        if let Err(mpsc::error::SendError(outbound)) = self.enriched.send(outbound).await {
            nak_all(outbound.delivery).await;
            return Err(StreamError::StageClosed("enriched sink".to_string()));
        }

        let target = partition_for(event.event_type(), self.aggregators.len());
        self.aggregators[target]
            .send(AggregatorInput::Event { event, origin })
            .await
            .map_err(|_| StreamError::StageClosed(format!("aggregator {}", target)))
    }
}

struct AggregatorTask {
    partition: usize,
    aggregator: WindowAggregator,
    combiner: WatermarkCombiner,
    output: mpsc::Sender<Outbound>,
    aggregates_topic: String,
    late_topic: Option<String>,
    clock: SharedClock,
    report: AggregatorReport,
}

impl AggregatorTask {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<AggregatorInput>,
        tick: Duration,
    ) -> Result<AggregatorReport> {
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                input = rx.recv() => match input {
                    Some(AggregatorInput::Event { event, origin }) => self.add(event, origin).await?,
                    Some(AggregatorInput::Watermark { upstream, watermark }) => {
                        if let Some(combined) = self.combiner.update(upstream, watermark) {
                            let closed = self.aggregator.on_watermark(combined);
                            self.emit(closed).await?;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let closed = self.aggregator.on_timer(self.clock.now_millis());
                    self.emit(closed).await?;
                }
            }
        }

        let flushed = self.aggregator.flush();
        self.emit(flushed).await?;
        self.report.late_events = self.aggregator.late_events();
        tracing::debug!(partition = self.partition, "Aggregator drained");
        Ok(self.report)
    }

    async fn add(&mut self, event: EnrichedEvent, origin: String) -> Result<()> {
        match self.aggregator.add(event) {
            Ok(Admission::Late(event)) => match &self.late_topic {
                Some(topic) => {
                    let record = SinkRecord::json(topic, format!("late:{}", origin), &event)?;
                    self.send(record).await
                }
                None => Ok(()),
            },
            Ok(Admission::DroppedLate) => {
                tracing::info!(
                    partition = self.partition,
                    origin = %origin,
                    policy = ?LatePolicy::Drop,
                    "Late event dropped"
                );
                Ok(())
            }
            Ok(Admission::Accepted) | Ok(Admission::Skipped) => Ok(()),
            Err(e) => {
                self.reset(e);
                Ok(())
            }
        }
    }

    async fn emit(&mut self, closed: Result<Vec<AggregationResult>>) -> Result<()> {
        let results = match closed {
            Ok(results) => results,
            Err(e) => {
                self.reset(e);
                return Ok(());
            }
        };
        for result in results {
            let msg_id = format!("agg:{}:{}", result.event_type, result.time_bucket_start);
            let record = SinkRecord::json(&self.aggregates_topic, msg_id, &result)?;
            self.send(record).await?;
            self.report.windows_emitted += 1;
        }
        Ok(())
    }

    async fn send(&self, record: SinkRecord) -> Result<()> {
        self.output
            .send(record.into())
            .await
            .map_err(|_| StreamError::StageClosed("aggregates sink".to_string()))
    }

    fn reset(&mut self, e: StreamError) {
        tracing::error!(partition = self.partition, error = %e, "Window state corrupted");
        self.aggregator.reset();
    }
}

/// Publish records in order, settling each input message after its record
async fn run_sink(
    name: &'static str,
    sink: SinkAdapter,
    mut rx: mpsc::Receiver<Outbound>,
    fatal: Arc<Notify>,
) -> Result<u64> {
    let mut published = 0;
    while let Some(Outbound { record, delivery }) = rx.recv().await {
        if let Err(e) = sink.deliver(&record).await {
            tracing::error!(sink = name, topic = %record.topic, error = %e, "Sink failed");
            // Stop the source before anything is released for redelivery
            fatal.notify_one();

            let mut unsettled: Vec<PendingMessage> = delivery.into_iter().collect();
            rx.close();
            while let Some(outbound) = rx.recv().await {
                unsettled.extend(outbound.delivery);
            }
            nak_all(unsettled).await;
            return Err(e);
        }
        if let Some(delivery) = delivery {
            if let Err(e) = delivery.ack().await {
                tracing::warn!(sink = name, error = %e, "Failed to ack message, it may be redelivered");
            }
        }
        published += 1;
    }
    tracing::debug!(sink = name, published, "Sink drained");
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_for_is_stable() {
        let a = partition_for("LOGIN:u1", 8);
        assert_eq!(a, partition_for("LOGIN:u1", 8));
        assert!(a < 8);
        assert_eq!(partition_for("anything", 1), 0);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn test_record_error_prefers_root_cause() {
        let mut slot = None;
        record_error(&mut slot, StreamError::StageClosed("detector 0".to_string()));
        record_error(&mut slot, StreamError::Timeout("publish".to_string()));
        assert!(matches!(slot, Some(StreamError::Timeout(_))));

        record_error(&mut slot, StreamError::Config("x".to_string()));
        assert!(matches!(slot, Some(StreamError::Timeout(_))));
    }
}
