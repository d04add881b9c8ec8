//! Error types for the submission engine

use ferrytrace_core::ports::StreamKind;
use thiserror::Error;

/// Errors surfaced to callers of a [`SchedulerHandle`](crate::SchedulerHandle)
///
/// Delivery failures are never errors; they arrive as
/// [`SubmissionOutcome`](crate::SubmissionOutcome) values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The worker for this stream has stopped
    #[error("Submission scheduler for {0} has stopped")]
    Stopped(StreamKind),

    /// No endpoint configured for the stream
    #[error("No endpoint configured for {0}")]
    MissingEndpoint(StreamKind),
}

pub type Result<T> = std::result::Result<T, SubmitError>;
