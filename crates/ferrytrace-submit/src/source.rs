//! Batch sources
//!
//! A [`BatchSource`] is whatever a stream drains: the record database for
//! reports, an in-memory event queue for telemetry. The scheduler owns the
//! timing; the source owns the items and decides what happens to them when
//! an attempt ends.

use std::path::PathBuf;

use ferrytrace_core::domain::BatchId;
use ferrytrace_core::ports::StreamKind;

/// A batch on its way to the collector
#[derive(Debug, Clone)]
pub struct Batch<T> {
    pub id: BatchId,
    pub items: Vec<T>,
    /// Failed attempts so far
    pub failures: u32,
}

impl<T> Batch<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            id: BatchId::new(),
            items,
            failures: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Wire form of a batch
#[derive(Debug, Clone, Default)]
pub struct EncodedBatch {
    pub payload: Vec<u8>,
    pub attachments: Vec<PathBuf>,
}

impl EncodedBatch {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            attachments: Vec::new(),
        }
    }
}

/// Items a [`SubmissionScheduler`](crate::SubmissionScheduler) drains
///
/// All callbacks run on the stream's worker task, one at a time.
pub trait BatchSource: Send + Sync + 'static {
    type Item: Send + 'static;

    fn stream(&self) -> StreamKind;

    /// Takes the next ready batch, `None` once nothing is queued.
    fn next_batch(&self) -> Option<Vec<Self::Item>>;

    /// Serializes a batch. `dropped_events` is the number of failed attempts
    /// so far.
    fn encode(&self, items: &[Self::Item], dropped_events: u32) -> anyhow::Result<EncodedBatch>;

    /// The collector accepted the batch.
    fn on_delivered(&self, items: Vec<Self::Item>);

    /// A transient failure will be retried; returns the items that stay in
    /// the batch.
    fn on_retry(&self, items: Vec<Self::Item>) -> Vec<Self::Item> {
        items
    }

    /// The batch is dropped (permanent failure or exhausted budget).
    fn on_abandoned(&self, items: Vec<Self::Item>);

    /// The scheduler stopped before the batch finished.
    fn on_cancelled(&self, _items: Vec<Self::Item>) {}
}
