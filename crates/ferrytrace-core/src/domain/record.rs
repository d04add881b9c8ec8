//! Record entity
//!
//! A `Record` is one persisted report: an opaque payload plus the attachment
//! files copied next to it. Records are created once and only ever deleted;
//! retry bucket and lock state belong to the in-memory index and are
//! surfaced through [`RecordState`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::RecordId;

/// A durable unit of queued work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    id: RecordId,
    created_at: DateTime<Utc>,
    size: u64,
    payload_len: u64,
    attachments: Vec<PathBuf>,
}

impl Record {
    /// Assemble a record from values produced by the store.
    pub fn new(
        id: RecordId,
        created_at: DateTime<Utc>,
        size: u64,
        payload_len: u64,
        attachments: Vec<PathBuf>,
    ) -> Self {
        Self {
            id,
            created_at,
            size,
            payload_len,
            attachments,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Total bytes this record occupies on disk, fixed at creation
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Length of the serialized payload in bytes
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Paths of the attachment copies owned by this record
    pub fn attachments(&self) -> &[PathBuf] {
        &self.attachments
    }

    /// Returns true if `path` is one of this record's attachment copies
    pub fn owns_attachment(&self, path: &Path) -> bool {
        self.attachments.iter().any(|a| a == path)
    }
}

/// Snapshot of a record's position in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordState {
    /// Number of failed delivery attempts the record has been charged with
    pub bucket: u32,
    /// True while a delivery attempt (or its scheduled retry) owns the record
    pub locked: bool,
}

// ============================================================================
// Ordering policies
// ============================================================================

/// Order in which records are handed to the submission engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOrder {
    /// Oldest record first (FIFO)
    #[default]
    Queue,
    /// Newest record first (LIFO)
    Stack,
}

/// Which record `increment_retry_bucket` charges with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionOrder {
    /// The oldest unlocked record by insertion, regardless of retry order
    #[default]
    Insertion,
    /// The record `first()` would return under the configured retry order
    Retrieval,
}

impl fmt::Display for RetryOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryOrder::Queue => "queue",
            RetryOrder::Stack => "stack",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RetryOrder {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queue" | "fifo" => Ok(RetryOrder::Queue),
            "stack" | "lifo" => Ok(RetryOrder::Stack),
            other => Err(DomainError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for PromotionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PromotionOrder::Insertion => "insertion",
            PromotionOrder::Retrieval => "retrieval",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PromotionOrder {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "insertion" => Ok(PromotionOrder::Insertion),
            "retrieval" => Ok(PromotionOrder::Retrieval),
            other => Err(DomainError::UnknownPolicy(other.to_string())),
        }
    }
}
