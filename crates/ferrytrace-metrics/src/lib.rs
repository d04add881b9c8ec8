//! ferrytrace Metrics - Telemetry event batching
//!
//! Provides:
//! - `EventBatcher`: in-memory accumulation of unique and summed events,
//!   drained by a `SubmissionScheduler` on its own stream
//! - `EventMetrics`: both batchers plus the startup events
//! - `EventsPayload`: the serialized form of one event batch

pub mod batcher;
pub mod error;
pub mod metrics;
pub mod payload;
pub mod queue;

pub use batcher::{EventBatcher, SummedEventBatcher, UniqueEventBatcher};
pub use error::EventError;
pub use metrics::{EventMetrics, APPLICATION_LAUNCHES, DEFAULT_UNIQUE_EVENT};
pub use payload::{EventsMetadata, EventsPayload};
pub use queue::{BatcherSettings, EventKind, EventQueue};
