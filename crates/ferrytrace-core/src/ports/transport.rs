//! Delivery transport port (driven/secondary port)
//!
//! The submission engine hands one serialized batch at a time to an
//! [`ITransport`] and classifies the returned status code.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because transport failures are adapter-specific.
//!   An `Err` means no status was received (connection refused, timeout)
//!   and is treated like a transient server failure.
//! - The transport must not retry on its own; retry timing belongs to the
//!   scheduler.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::BatchId;

/// The independent submission streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Persisted reports drained from the record database
    Reports,
    /// Unique telemetry events
    UniqueEvents,
    /// Summed telemetry events
    SummedEvents,
}

impl StreamKind {
    /// Stable label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Reports => "reports",
            StreamKind::UniqueEvents => "unique_events",
            StreamKind::SummedEvents => "summed_events",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery attempt
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub stream: StreamKind,
    pub batch_id: BatchId,
    /// 1-based attempt number for this batch
    pub attempt: u32,
    pub payload: Vec<u8>,
    /// Files that travel with the payload (reports only)
    pub attachments: Vec<PathBuf>,
}

/// Status and raw body returned by the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Port for delivering batches to the collection service
#[async_trait]
pub trait ITransport: Send + Sync {
    /// Submit one batch.
    ///
    /// # Returns
    /// The collector's status and body, or an error if no response arrived.
    async fn submit(&self, request: SubmitRequest) -> anyhow::Result<TransportResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_labels() {
        assert_eq!(StreamKind::Reports.to_string(), "reports");
        assert_eq!(StreamKind::UniqueEvents.as_str(), "unique_events");
        assert_eq!(
            serde_json::to_string(&StreamKind::SummedEvents).unwrap(),
            "\"summed_events\""
        );
    }

    #[test]
    fn test_response_success_range() {
        assert!(TransportResponse::new(200, "").is_success());
        assert!(TransportResponse::new(204, "").is_success());
        assert!(!TransportResponse::new(302, "").is_success());
        assert!(!TransportResponse::new(503, "busy").is_success());
    }
}
