//! ferrytrace Submit - Retrying batch submission engine
//!
//! Provides:
//! - `SubmissionScheduler`: one worker task per stream that drains a
//!   `BatchSource`, hands batches to an `ITransport`, and reschedules
//!   transient failures with capped exponential backoff plus jitter
//! - `RetryPolicy`: backoff arithmetic and status classification
//! - `ReportQueue`: the record database as a report stream
//! - `HttpTransport`: default reqwest-based transport
//! - `SubmissionOutcome`: per-attempt results delivered over a channel

pub mod backoff;
pub mod error;
pub mod http;
pub mod outcome;
pub mod report_queue;
pub mod scheduler;
pub mod source;

pub use backoff::{classify, Classification, RetryPolicy};
pub use error::SubmitError;
pub use http::{Endpoints, HttpTransport};
pub use outcome::{DeliveryStatus, SubmissionOutcome};
pub use report_queue::{ReportItem, ReportQueue};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SubmissionScheduler};
pub use source::{Batch, BatchSource, EncodedBatch};
