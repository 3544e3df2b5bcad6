//! # audit-stream
//!
//! Streaming enrichment, burst anomaly detection, and windowed aggregation
//! of audit events.
//!
//! ## Overview
//!
//! Raw audit events are consumed from a bus topic, enriched with a coarse
//! geolocation and a risk score, checked for per-user bursts, and published
//! to an enriched stream. In parallel the enriched events are grouped by
//! `event_type` into tumbling windows, and one summary per closed window is
//! published to an aggregates stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use audit_stream::config::PipelineConfig;
//! use audit_stream::pipeline::Pipeline;
//! use audit_stream::provider::memory::MemoryProvider;
//! use std::sync::Arc;
//!
//! # async fn example() -> audit_stream::Result<()> {
//! let provider = Arc::new(MemoryProvider::new());
//! let report = Pipeline::new(PipelineConfig::default(), provider)
//!     .run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! println!("Processed {} events", report.received);
//! # Ok(())
//! # }
//! ```
//!
//! ## Stages
//!
//! - **enrich**: stateless geolocation and risk scoring
//! - **anomaly**: per-key inter-arrival statistics and burst verdicts
//! - **window**: per-type tumbling windows driven by timers or watermarks
//! - **source / sink**: bus adapters with dead-lettering and retrying publish
//!
//! ## Providers
//!
//! - **memory**: in-process bus for tests and local runs
//! - **nats**: NATS JetStream

pub mod anomaly;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod dlq;
pub mod enrich;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod sink;
pub mod source;
pub mod types;
pub mod watermark;
pub mod window;

pub use anomaly::{AnomalyDetector, KeyStats, Verdict};
pub use config::PipelineConfig;
pub use enrich::{Enricher, Enrichment, GeoLocator, RiskTable};
pub use error::{Result, StreamError};
pub use pipeline::{Pipeline, PipelineReport};
pub use provider::{EventProvider, Subscription};
pub use types::{AggregationResult, EnrichedEvent, Geolocation, RawEvent};
pub use window::{LatePolicy, TimeDomain, WindowAggregator};
