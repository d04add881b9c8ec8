//! Error types for the record store and index

use ferrytrace_core::domain::RecordId;
use thiserror::Error;

/// Errors raised by [`RecordStore`](crate::RecordStore)
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure; any partial files of the operation were removed
    #[error("IO error: {0}")]
    IoFailure(#[from] std::io::Error),

    /// The record's files exist but cannot be trusted; they have been deleted
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: RecordId, reason: String },

    #[error("Record not found: {0}")]
    NotFound(RecordId),

    #[error("Manifest serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by [`RecordIndex`](crate::RecordIndex)
#[derive(Debug, Error)]
pub enum IndexError {
    /// `add` was handed the empty (nil) record reference
    #[error("Cannot index an empty record reference")]
    NullRecord,

    /// A lookup was handed the empty (nil) record reference
    #[error("Record argument must not be empty")]
    NullArgument,

    /// A single record is larger than the whole byte budget
    #[error("Record of {size} bytes exceeds the database budget of {max} bytes")]
    CapacityExceeded { size: u64, max: u64 },

    /// The index was built with zero retry buckets
    #[error("Retry limit must be at least 1")]
    InvalidRetryLimit,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
