//! Report stream over the record database
//!
//! Each batch is a single record, locked in the index for as long as it is
//! in flight or waiting for a retry. The record's retry bucket is the
//! durable-side retry budget: every transient failure promotes it, and a
//! record promoted past the last bucket is deleted, which ends the batch.

use std::sync::Arc;

use ferrytrace_core::domain::Record;
use ferrytrace_core::ports::StreamKind;
use ferrytrace_store::{Database, IndexError, Promotion, StoreError};
use tracing::{debug, warn};

use crate::source::{BatchSource, EncodedBatch};

/// A locked record and its payload
#[derive(Debug, Clone)]
pub struct ReportItem {
    pub record: Record,
    pub payload: Vec<u8>,
}

/// [`BatchSource`] that drains persisted reports
pub struct ReportQueue {
    db: Arc<Database>,
}

impl ReportQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn delete(&self, item: &ReportItem) {
        if let Err(e) = self.db.delete_locked(item.record.id()) {
            warn!(record_id = %item.record.id(), error = %e, "Failed to delete report");
        }
    }
}

impl BatchSource for ReportQueue {
    type Item = ReportItem;

    fn stream(&self) -> StreamKind {
        StreamKind::Reports
    }

    fn next_batch(&self) -> Option<Vec<ReportItem>> {
        loop {
            let record = self.db.lock_first()?;
            let id = record.id();
            match self.db.read(id) {
                Ok(stored) => {
                    return Some(vec![ReportItem {
                        record: stored.record,
                        payload: stored.payload,
                    }]);
                }
                Err(IndexError::Store(
                    e @ (StoreError::CorruptRecord { .. } | StoreError::NotFound(_)),
                )) => {
                    // already dropped from the index by `read`
                    warn!(record_id = %id, error = %e, "Skipping unreadable report");
                }
                Err(e) => {
                    warn!(record_id = %id, error = %e, "Failed to read report, leaving it queued");
                    self.db.index().unlock(id);
                    return None;
                }
            }
        }
    }

    fn encode(&self, items: &[ReportItem], _dropped_events: u32) -> anyhow::Result<EncodedBatch> {
        let [item] = items else {
            anyhow::bail!("report batches carry exactly one record, got {}", items.len());
        };
        Ok(EncodedBatch {
            payload: item.payload.clone(),
            attachments: item.record.attachments().to_vec(),
        })
    }

    fn on_delivered(&self, items: Vec<ReportItem>) {
        for item in &items {
            self.delete(item);
        }
    }

    fn on_retry(&self, items: Vec<ReportItem>) -> Vec<ReportItem> {
        items
            .into_iter()
            .filter(|item| match self.db.index().promote(item.record.id()) {
                Ok(Promotion::Promoted { bucket, .. }) => {
                    debug!(record_id = %item.record.id(), bucket, "Report promoted");
                    true
                }
                Ok(Promotion::Exhausted { .. }) | Ok(Promotion::NotFound) => false,
                Err(e) => {
                    warn!(record_id = %item.record.id(), error = %e, "Failed to promote report");
                    false
                }
            })
            .collect()
    }

    fn on_abandoned(&self, items: Vec<ReportItem>) {
        for item in &items {
            self.delete(item);
        }
    }

    fn on_cancelled(&self, items: Vec<ReportItem>) {
        for item in &items {
            self.db.index().unlock(item.record.id());
        }
    }
}
