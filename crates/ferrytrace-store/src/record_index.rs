//! In-memory retry index over the record store
//!
//! The index keeps every live record in exactly one retry bucket
//! (`0..retry_limit`). A record enters bucket 0 and moves up one bucket per
//! failed delivery; moving past the last bucket deletes it.
//!
//! Selection (`first`, `lock_first`) scans from the highest bucket down, so
//! the records closest to abandonment get retried first. Inside a bucket the
//! configured [`RetryOrder`] picks the oldest (queue) or the newest (stack)
//! unlocked record. Eviction ignores buckets and ordering and always removes
//! the oldest unlocked record by insertion.
//!
//! All mutations happen behind one mutex. Files are removed through the
//! [`RecordStore`] after a record has left the index, so a deleted record can
//! never be selected again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ferrytrace_core::domain::{PromotionOrder, Record, RecordId, RecordState, RetryOrder};
use tracing::{debug, info, warn};

use crate::error::IndexError;
use crate::record_store::RecordStore;

type Result<T> = std::result::Result<T, IndexError>;

/// Result of charging a record with one failed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Promotion {
    /// The record moved to `bucket`
    Promoted { id: RecordId, bucket: u32 },
    /// The record was past its last bucket and has been deleted
    Exhausted { id: RecordId },
    /// The record is not in the index
    NotFound,
}

#[derive(Debug, Clone)]
struct Entry {
    record: Record,
    seq: u64,
    locked: bool,
}

#[derive(Debug)]
struct Inner {
    /// One vector per bucket, each sorted by insertion sequence
    buckets: Vec<Vec<Entry>>,
    next_seq: u64,
    total_size: u64,
    count: usize,
}

impl Inner {
    fn position(&self, id: RecordId) -> Option<(usize, usize)> {
        self.buckets.iter().enumerate().find_map(|(b, entries)| {
            entries
                .iter()
                .position(|e| e.record.id() == id)
                .map(|i| (b, i))
        })
    }

    fn take(&mut self, bucket: usize, index: usize) -> Entry {
        let entry = self.buckets[bucket].remove(index);
        self.total_size = self.total_size.saturating_sub(entry.record.size());
        self.count -= 1;
        entry
    }

    /// Head of line under `order`: highest bucket first, unlocked only.
    fn select(&self, order: RetryOrder) -> Option<(usize, usize)> {
        for (b, entries) in self.buckets.iter().enumerate().rev() {
            let found = match order {
                RetryOrder::Queue => entries.iter().position(|e| !e.locked),
                RetryOrder::Stack => entries.iter().rposition(|e| !e.locked),
            };
            if let Some(i) = found {
                return Some((b, i));
            }
        }
        None
    }

    /// Oldest unlocked record by insertion, optionally skipping one id.
    fn oldest(&self, exclude: Option<RecordId>) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, u64)> = None;
        for (b, entries) in self.buckets.iter().enumerate() {
            let candidate = entries
                .iter()
                .position(|e| !e.locked && Some(e.record.id()) != exclude);
            if let Some(i) = candidate {
                let seq = entries[i].seq;
                if best.map_or(true, |(_, _, s)| seq < s) {
                    best = Some((b, i, seq));
                }
            }
        }
        best.map(|(b, i, _)| (b, i))
    }

    fn insert_sorted(&mut self, bucket: usize, entry: Entry) {
        let entries = &mut self.buckets[bucket];
        let at = entries.partition_point(|e| e.seq < entry.seq);
        entries.insert(at, entry);
    }
}

/// Ordered, bucketed view of the records in a [`RecordStore`]
pub struct RecordIndex {
    store: Arc<RecordStore>,
    order: RetryOrder,
    promotion: PromotionOrder,
    retry_limit: u32,
    inner: Mutex<Inner>,
}

impl RecordIndex {
    /// Creates an empty index with `retry_limit` buckets.
    pub fn new(
        store: Arc<RecordStore>,
        order: RetryOrder,
        promotion: PromotionOrder,
        retry_limit: u32,
    ) -> Result<Self> {
        if retry_limit == 0 {
            return Err(IndexError::InvalidRetryLimit);
        }
        Ok(Self {
            store,
            order,
            promotion,
            retry_limit,
            inner: Mutex::new(Inner {
                buckets: vec![Vec::new(); retry_limit as usize],
                next_seq: 0,
                total_size: 0,
                count: 0,
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn retry_order(&self) -> RetryOrder {
        self.order
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    // ========================================================================
    // Insertion and lookup
    // ========================================================================

    /// Adds a stored record to bucket 0, unlocked.
    ///
    /// Fails with `NullRecord` for the nil id. Adding an id that is already
    /// indexed returns the indexed record unchanged.
    pub fn add(&self, record: Record) -> Result<Record> {
        if record.id().is_nil() {
            return Err(IndexError::NullRecord);
        }
        let mut inner = self.inner();
        if let Some((b, i)) = inner.position(record.id()) {
            return Ok(inner.buckets[b][i].record.clone());
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.total_size += record.size();
        inner.count += 1;
        inner.buckets[0].push(Entry {
            record: record.clone(),
            seq,
            locked: false,
        });
        debug!(record_id = %record.id(), count = inner.count, "Record indexed");
        Ok(record)
    }

    /// Fails with `NullArgument` for the nil id.
    pub fn contains(&self, id: RecordId) -> Result<bool> {
        if id.is_nil() {
            return Err(IndexError::NullArgument);
        }
        Ok(self.inner().position(id).is_some())
    }

    pub fn get(&self, id: RecordId) -> Option<Record> {
        let inner = self.inner();
        inner
            .position(id)
            .map(|(b, i)| inner.buckets[b][i].record.clone())
    }

    /// Bucket and lock state of a record
    pub fn state(&self, id: RecordId) -> Option<RecordState> {
        let inner = self.inner();
        inner.position(id).map(|(b, i)| RecordState {
            bucket: b as u32,
            locked: inner.buckets[b][i].locked,
        })
    }

    /// Every record with its state, oldest first
    pub fn snapshot(&self) -> Vec<(Record, RecordState)> {
        let inner = self.inner();
        let mut all: Vec<(u64, Record, RecordState)> = inner
            .buckets
            .iter()
            .enumerate()
            .flat_map(|(b, entries)| {
                entries.iter().map(move |e| {
                    (
                        e.seq,
                        e.record.clone(),
                        RecordState {
                            bucket: b as u32,
                            locked: e.locked,
                        },
                    )
                })
            })
            .collect();
        all.sort_by_key(|(seq, _, _)| *seq);
        all.into_iter().map(|(_, r, s)| (r, s)).collect()
    }

    /// Ids of every indexed record
    pub fn ids(&self) -> Vec<RecordId> {
        self.inner()
            .buckets
            .iter()
            .flatten()
            .map(|e| e.record.id())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.inner().count
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Sum of the sizes of all indexed records
    pub fn total_size(&self) -> u64 {
        self.inner().total_size
    }

    // ========================================================================
    // Selection and locking
    // ========================================================================

    /// Head of the index under the retry order, without locking it.
    pub fn first(&self) -> Option<Record> {
        let inner = self.inner();
        inner
            .select(self.order)
            .map(|(b, i)| inner.buckets[b][i].record.clone())
    }

    /// Tail of the index under the retry order, without locking it.
    pub fn last(&self) -> Option<Record> {
        let reversed = match self.order {
            RetryOrder::Queue => RetryOrder::Stack,
            RetryOrder::Stack => RetryOrder::Queue,
        };
        let inner = self.inner();
        inner
            .select(reversed)
            .map(|(b, i)| inner.buckets[b][i].record.clone())
    }

    /// Selects the head record and locks it for a delivery attempt.
    pub fn lock_first(&self) -> Option<Record> {
        let mut inner = self.inner();
        let (b, i) = inner.select(self.order)?;
        let entry = &mut inner.buckets[b][i];
        entry.locked = true;
        debug!(record_id = %entry.record.id(), bucket = b, "Record locked for delivery");
        Some(entry.record.clone())
    }

    /// Releases a delivery lock. Returns false if the record is unknown.
    pub fn unlock(&self, id: RecordId) -> bool {
        let mut inner = self.inner();
        match inner.position(id) {
            Some((b, i)) => {
                inner.buckets[b][i].locked = false;
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Removes a record from the index and deletes its files.
    ///
    /// Idempotent: unknown, already deleted and nil ids return `false`.
    /// A record locked for delivery is left alone and also yields `false`.
    pub fn delete(&self, id: RecordId) -> Result<bool> {
        self.remove(id, false)
    }

    /// Removes a record the caller holds the delivery lock for.
    pub fn delete_locked(&self, id: RecordId) -> Result<bool> {
        self.remove(id, true)
    }

    fn remove(&self, id: RecordId, lock_owner: bool) -> Result<bool> {
        if id.is_nil() {
            return Ok(false);
        }
        let removed = {
            let mut inner = self.inner();
            match inner.position(id) {
                Some((b, i)) if inner.buckets[b][i].locked && !lock_owner => {
                    debug!(record_id = %id, "Record in flight, not deleted");
                    return Ok(false);
                }
                Some((b, i)) => {
                    inner.take(b, i);
                    true
                }
                None => false,
            }
        };
        let deleted = self.store.delete(id)?;
        Ok(removed || deleted)
    }

    /// Evicts the oldest unlocked record by insertion order.
    ///
    /// Returns false when every record is locked or the index is empty.
    pub fn remove_oldest_record(&self) -> Result<bool> {
        Ok(self.evict_oldest(None)?.is_some())
    }

    pub(crate) fn evict_oldest(&self, exclude: Option<RecordId>) -> Result<Option<Record>> {
        let entry = {
            let mut inner = self.inner();
            match inner.oldest(exclude) {
                Some((b, i)) => inner.take(b, i),
                None => return Ok(None),
            }
        };
        self.store.delete(entry.record.id())?;
        info!(record_id = %entry.record.id(), size = entry.record.size(), "Evicted oldest record");
        Ok(Some(entry.record))
    }

    /// Drops every record and every file in the store.
    pub fn clear(&self) -> Result<()> {
        {
            let mut inner = self.inner();
            for bucket in inner.buckets.iter_mut() {
                bucket.clear();
            }
            inner.total_size = 0;
            inner.count = 0;
        }
        self.store.clear()?;
        Ok(())
    }

    // ========================================================================
    // Retry accounting
    // ========================================================================

    /// Charges one record with a failed delivery, moving it up one bucket.
    ///
    /// A record already in the last bucket is deleted. The lock state is kept.
    pub fn promote(&self, id: RecordId) -> Result<Promotion> {
        {
            let mut inner = self.inner();
            let Some((b, i)) = inner.position(id) else {
                return Ok(Promotion::NotFound);
            };
            let next = b + 1;
            if next < self.retry_limit as usize {
                let entry = inner.buckets[b].remove(i);
                inner.insert_sorted(next, entry);
                debug!(record_id = %id, bucket = next, "Record promoted");
                return Ok(Promotion::Promoted {
                    id,
                    bucket: next as u32,
                });
            }
            inner.take(b, i);
        }
        self.store.delete(id)?;
        info!(record_id = %id, retry_limit = self.retry_limit, "Record exhausted its retry budget");
        Ok(Promotion::Exhausted { id })
    }

    /// Promotes the head-of-line record chosen by the promotion order.
    ///
    /// Returns `Promotion::NotFound` when no unlocked record exists.
    pub fn increment_retry_bucket(&self) -> Result<Promotion> {
        let target = {
            let inner = self.inner();
            let position = match self.promotion {
                PromotionOrder::Insertion => inner.oldest(None),
                PromotionOrder::Retrieval => inner.select(self.order),
            };
            position.map(|(b, i)| inner.buckets[b][i].record.id())
        };
        match target {
            Some(id) => self.promote(id),
            None => Ok(Promotion::NotFound),
        }
    }

    /// Advances every bucket by one.
    ///
    /// Unlocked records in the last bucket are deleted first; locked ones stay
    /// where they are. Returns the number of records deleted.
    pub fn increment_batch_retry(&self) -> Result<usize> {
        let expired: Vec<Entry> = {
            let mut inner = self.inner();
            let last = self.retry_limit as usize - 1;

            let (keep, expired): (Vec<Entry>, Vec<Entry>) =
                std::mem::take(&mut inner.buckets[last])
                    .into_iter()
                    .partition(|e| e.locked);
            inner.buckets[last] = keep;
            for entry in &expired {
                inner.total_size = inner.total_size.saturating_sub(entry.record.size());
                inner.count -= 1;
            }

            for b in (0..last).rev() {
                let moving = std::mem::take(&mut inner.buckets[b]);
                for entry in moving {
                    inner.insert_sorted(b + 1, entry);
                }
            }
            expired
        };

        for entry in &expired {
            if let Err(e) = self.store.delete(entry.record.id()) {
                warn!(record_id = %entry.record.id(), error = %e, "Failed to delete expired record");
            }
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "Removed records past the retry limit");
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Utc;
    use ferrytrace_core::ports::SystemClock;
    use tempfile::TempDir;

    use super::*;
    use crate::record_store::StoreLimits;

    fn setup(order: RetryOrder, promotion: PromotionOrder, limit: u32) -> (TempDir, RecordIndex) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            RecordStore::open(dir.path(), StoreLimits::unlimited(), Arc::new(SystemClock)).unwrap(),
        );
        let index = RecordIndex::new(store, order, promotion, limit).unwrap();
        (dir, index)
    }

    fn add(index: &RecordIndex, payload: &[u8]) -> Record {
        let record = index.store().add(payload, &[]).unwrap();
        index.add(record).unwrap()
    }

    #[test]
    fn test_zero_retry_limit_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            RecordStore::open(dir.path(), StoreLimits::unlimited(), Arc::new(SystemClock)).unwrap(),
        );
        let result = RecordIndex::new(store, RetryOrder::Queue, PromotionOrder::Insertion, 0);
        assert!(matches!(result, Err(IndexError::InvalidRetryLimit)));
    }

    #[test]
    fn test_add_rejects_nil_record() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        let nil = Record::new(RecordId::nil(), Utc::now(), 0, 0, Vec::<PathBuf>::new());
        assert!(matches!(index.add(nil), Err(IndexError::NullRecord)));
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn test_contains_is_strict_but_delete_is_tolerant() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        assert!(matches!(
            index.contains(RecordId::nil()),
            Err(IndexError::NullArgument)
        ));
        assert!(!index.delete(RecordId::nil()).unwrap());
    }

    #[test]
    fn test_counters_follow_add_and_delete() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        let a = add(&index, b"a");
        let b = add(&index, b"bb");
        assert_eq!(index.count(), 2);
        assert_eq!(index.total_size(), a.size() + b.size());

        assert!(index.delete(a.id()).unwrap());
        assert!(!index.delete(a.id()).unwrap());
        assert_eq!(index.count(), 1);
        assert_eq!(index.total_size(), b.size());
        assert_eq!(index.store().record_count(), 1);
        assert!(!index.contains(a.id()).unwrap());
    }

    #[test]
    fn test_delete_leaves_locked_record_alone() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        let record = add(&index, b"in flight");
        assert_eq!(index.lock_first().unwrap().id(), record.id());

        assert!(!index.delete(record.id()).unwrap());
        assert!(index.contains(record.id()).unwrap());
        assert_eq!(index.store().record_count(), 1);
        assert!(matches!(
            index.promote(record.id()).unwrap(),
            Promotion::Promoted { bucket: 1, .. }
        ));

        assert!(index.delete_locked(record.id()).unwrap());
        assert_eq!(index.count(), 0);
        assert_eq!(index.store().record_count(), 0);
    }

    #[test]
    fn test_queue_and_stack_ordering() {
        let (_dir, queue) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        let q1 = add(&queue, b"1");
        let q2 = add(&queue, b"2");
        assert_eq!(queue.first().unwrap().id(), q1.id());
        assert_eq!(queue.last().unwrap().id(), q2.id());

        let (_dir, stack) = setup(RetryOrder::Stack, PromotionOrder::Insertion, 3);
        let s1 = add(&stack, b"1");
        let s2 = add(&stack, b"2");
        assert_eq!(stack.first().unwrap().id(), s2.id());
        assert_eq!(stack.last().unwrap().id(), s1.id());
    }

    #[test]
    fn test_first_on_empty_index() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        assert!(index.first().is_none());
        assert!(index.last().is_none());
        assert!(index.lock_first().is_none());
    }

    #[test]
    fn test_lock_first_skips_locked_records() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        let a = add(&index, b"a");
        let b = add(&index, b"b");

        assert_eq!(index.lock_first().unwrap().id(), a.id());
        assert!(index.state(a.id()).unwrap().locked);
        assert_eq!(index.lock_first().unwrap().id(), b.id());
        assert!(index.lock_first().is_none());
        assert!(index.first().is_none());

        assert!(index.unlock(a.id()));
        assert_eq!(index.first().unwrap().id(), a.id());
    }

    #[test]
    fn test_higher_buckets_are_selected_first() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        let a = add(&index, b"a");
        let b = add(&index, b"b");
        index.promote(b.id()).unwrap();

        assert_eq!(index.first().unwrap().id(), b.id());
        assert_eq!(index.state(a.id()).unwrap().bucket, 0);
        assert_eq!(index.state(b.id()).unwrap().bucket, 1);
    }

    #[test]
    fn test_promote_past_limit_deletes() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 2);
        let a = add(&index, b"a");

        assert_eq!(
            index.promote(a.id()).unwrap(),
            Promotion::Promoted { id: a.id(), bucket: 1 }
        );
        assert_eq!(index.promote(a.id()).unwrap(), Promotion::Exhausted { id: a.id() });
        assert_eq!(index.promote(a.id()).unwrap(), Promotion::NotFound);
        assert_eq!(index.count(), 0);
        assert_eq!(index.store().record_count(), 0);
    }

    #[test]
    fn test_promote_keeps_lock() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        add(&index, b"x");
        let a = index.lock_first().unwrap().id();
        index.promote(a).unwrap();
        let state = index.state(a).unwrap();
        assert_eq!(state.bucket, 1);
        assert!(state.locked);
    }

    #[test]
    fn test_increment_retry_bucket_insertion_order() {
        let (_dir, index) = setup(RetryOrder::Stack, PromotionOrder::Insertion, 3);
        let oldest = add(&index, b"1");
        let newest = add(&index, b"2");

        let promotion = index.increment_retry_bucket().unwrap();
        assert_eq!(
            promotion,
            Promotion::Promoted {
                id: oldest.id(),
                bucket: 1
            }
        );
        assert_eq!(index.state(newest.id()).unwrap().bucket, 0);
    }

    #[test]
    fn test_increment_retry_bucket_retrieval_order() {
        let (_dir, index) = setup(RetryOrder::Stack, PromotionOrder::Retrieval, 3);
        let _oldest = add(&index, b"1");
        let newest = add(&index, b"2");

        let promotion = index.increment_retry_bucket().unwrap();
        assert_eq!(
            promotion,
            Promotion::Promoted {
                id: newest.id(),
                bucket: 1
            }
        );
    }

    #[test]
    fn test_increment_retry_bucket_on_empty_index() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        assert_eq!(index.increment_retry_bucket().unwrap(), Promotion::NotFound);
    }

    #[test]
    fn test_remove_oldest_ignores_ordering_and_locks() {
        let (_dir, index) = setup(RetryOrder::Stack, PromotionOrder::Insertion, 3);
        let a = add(&index, b"a");
        let b = add(&index, b"b");
        let c = add(&index, b"c");
        index.promote(c.id()).unwrap();

        // `a` is in flight, so `b` is the oldest evictable record
        index.inner().buckets[0][0].locked = true;

        assert!(index.remove_oldest_record().unwrap());
        assert!(index.contains(a.id()).unwrap());
        assert!(!index.contains(b.id()).unwrap());
        assert!(index.contains(c.id()).unwrap());
    }

    #[test]
    fn test_remove_oldest_on_empty_index() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        assert!(!index.remove_oldest_record().unwrap());
    }

    #[test]
    fn test_batch_retry_drains_after_retry_limit_rounds() {
        const RETRY_LIMIT: u32 = 5;
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, RETRY_LIMIT);
        for i in 0..10u8 {
            add(&index, &[i]);
        }

        let mut rounds = 0;
        for _ in 0..10 {
            if index.first().is_none() {
                break;
            }
            index.increment_batch_retry().unwrap();
            rounds += 1;
        }

        assert_eq!(rounds, RETRY_LIMIT);
        assert_eq!(index.count(), 0);
        assert_eq!(index.total_size(), 0);
        assert_eq!(index.store().record_count(), 0);
    }

    #[test]
    fn test_batch_retry_keeps_locked_records_in_last_bucket() {
        let (_dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 2);
        let a = add(&index, b"a");
        index.increment_batch_retry().unwrap();
        assert_eq!(index.state(a.id()).unwrap().bucket, 1);

        index.lock_first().unwrap();
        assert_eq!(index.increment_batch_retry().unwrap(), 0);
        assert!(index.contains(a.id()).unwrap());
    }

    #[test]
    fn test_snapshot_is_oldest_first() {
        let (_dir, index) = setup(RetryOrder::Stack, PromotionOrder::Insertion, 3);
        let a = add(&index, b"a");
        let b = add(&index, b"b");
        index.promote(b.id()).unwrap();

        let snapshot = index.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0.id(), a.id());
        assert_eq!(snapshot[1].1.bucket, 1);
    }

    #[test]
    fn test_clear_removes_everything() {
        let (dir, index) = setup(RetryOrder::Queue, PromotionOrder::Insertion, 3);
        add(&index, b"a");
        add(&index, b"b");
        index.clear().unwrap();
        assert!(index.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
