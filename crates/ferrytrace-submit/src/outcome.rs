//! Per-attempt delivery results
//!
//! The scheduler is the single writer of [`SubmissionOutcome`] values; hosts
//! receive them over an unbounded mpsc channel instead of registering
//! callbacks.

use std::fmt;
use std::time::Duration;

use ferrytrace_core::domain::BatchId;
use ferrytrace_core::ports::StreamKind;
use serde::Serialize;

/// How one delivery attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// 2xx; the batch is gone
    Ok,
    /// Network error or retryable server failure; a retry is scheduled
    TransientFailure,
    /// Rejected by the collector; the batch is dropped
    PermanentFailure,
    /// Transient failure with no attempts left; the batch is dropped
    RetryBudgetExhausted,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Ok => "ok",
            DeliveryStatus::TransientFailure => "transient_failure",
            DeliveryStatus::PermanentFailure => "permanent_failure",
            DeliveryStatus::RetryBudgetExhausted => "retry_budget_exhausted",
        }
    }

    /// Whether the batch is finished with (delivered or dropped)
    pub fn is_final(&self) -> bool {
        !matches!(self, DeliveryStatus::TransientFailure)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionOutcome {
    pub stream: StreamKind,
    pub batch_id: BatchId,
    pub status: DeliveryStatus,
    /// HTTP status, `None` when no response arrived
    pub status_code: Option<u16>,
    /// 1-based attempt number
    pub attempt: u32,
    /// Failed attempts carried in this attempt's payload metadata
    pub dropped_events: u32,
    /// Items discarded by this outcome (permanent failure or exhausted budget)
    pub abandoned_items: usize,
    /// Delay before the next attempt when one is scheduled
    #[serde(skip)]
    pub retry_in: Option<Duration>,
    /// Response body or transport error text
    pub message: Option<String>,
}

impl SubmissionOutcome {
    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Ok
    }
}
