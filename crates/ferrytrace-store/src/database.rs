//! Offline record database
//!
//! `Database` owns a [`RecordStore`] and the [`RecordIndex`] over it and is
//! the entry point producers and the report stream use.
//!
//! - **Startup recovery**: `open` loads every valid manifest into the index
//!   (corrupt records are deleted on the way), enforces the budgets, and
//!   purges orphaned files.
//! - **Capacity**: adding a record that pushes the database over its count or
//!   size budget evicts the oldest unlocked records until it fits again. The
//!   new record always survives, unless it alone is larger than the byte
//!   budget, in which case it is rejected and nothing is evicted.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use ferrytrace_core::config::DatabaseConfig;
use ferrytrace_core::domain::{PromotionOrder, Record, RecordId, RetryOrder};
use ferrytrace_core::ports::IClock;
use tracing::{info, instrument, warn};

use crate::error::{IndexError, StoreError};
use crate::record_index::RecordIndex;
use crate::record_store::{RecordStore, StoreLimits, StoredRecord};

type Result<T> = std::result::Result<T, IndexError>;

/// Runtime settings of a [`Database`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub path: PathBuf,
    /// Maximum number of records (0 = unlimited)
    pub max_record_count: u32,
    /// Maximum total bytes (0 = unlimited)
    pub max_database_size: u64,
    pub retry_limit: u32,
    pub retry_order: RetryOrder,
    pub promotion_order: PromotionOrder,
}

impl DatabaseSettings {
    /// Unlimited database at `path` with three retry buckets.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_record_count: 0,
            max_database_size: 0,
            retry_limit: 3,
            retry_order: RetryOrder::Queue,
            promotion_order: PromotionOrder::Insertion,
        }
    }

    pub fn limits(&self) -> StoreLimits {
        StoreLimits {
            max_bytes: self.max_database_size,
            max_records: self.max_record_count,
        }
    }
}

impl From<&DatabaseConfig> for DatabaseSettings {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            path: config.path.clone(),
            max_record_count: config.max_record_count,
            max_database_size: config.max_database_size_bytes(),
            retry_limit: config.retry_limit,
            retry_order: config.retry_order,
            promotion_order: config.promotion_order,
        }
    }
}

/// Durable record queue with retry accounting and capacity enforcement
pub struct Database {
    settings: DatabaseSettings,
    store: Arc<RecordStore>,
    index: RecordIndex,
    add_lock: Mutex<()>,
}

impl Database {
    /// Opens the database directory and recovers the records stored in it.
    #[instrument(skip(settings, clock), fields(path = %settings.path.display()))]
    pub fn open(settings: DatabaseSettings, clock: Arc<dyn IClock>) -> Result<Self> {
        let store = Arc::new(RecordStore::open(&settings.path, settings.limits(), clock)?);
        let index = RecordIndex::new(
            Arc::clone(&store),
            settings.retry_order,
            settings.promotion_order,
            settings.retry_limit,
        )?;
        let db = Self {
            settings,
            store,
            index,
            add_lock: Mutex::new(()),
        };

        let mut evicted = 0;
        for record in db.store.load_all()? {
            let id = record.id();
            if db.oversized(record.size()) {
                warn!(record_id = %id, size = record.size(), "Stored record exceeds the byte budget, discarding");
                db.store.delete(id)?;
                evicted += 1;
                continue;
            }
            db.index.add(record)?;
            evicted += db.enforce_capacity(id)?;
        }
        let orphans = db.reconcile()?;

        info!(
            records = db.index.count(),
            bytes = db.index.total_size(),
            evicted,
            orphans,
            "Record database opened"
        );
        Ok(db)
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub fn index(&self) -> &RecordIndex {
        &self.index
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    // ========================================================================
    // Producers
    // ========================================================================

    /// Stores a payload with its attachments and indexes it.
    ///
    /// Older records are evicted if the new one pushes the database over
    /// budget. A record that alone exceeds the byte budget is removed again
    /// and rejected with `CapacityExceeded`, leaving every other record in
    /// place.
    pub fn add(&self, payload: &[u8], attachments: &[PathBuf]) -> Result<Record> {
        let _guard = self.add_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let record = self.store.add(payload, attachments)?;
        if self.oversized(record.size()) {
            self.store.delete(record.id())?;
            warn!(
                size = record.size(),
                max = self.settings.max_database_size,
                "Record larger than the database budget rejected"
            );
            return Err(IndexError::CapacityExceeded {
                size: record.size(),
                max: self.settings.max_database_size,
            });
        }
        let record = self.index.add(record)?;
        self.enforce_capacity(record.id())?;
        Ok(record)
    }

    fn oversized(&self, size: u64) -> bool {
        self.settings.max_database_size > 0 && size > self.settings.max_database_size
    }

    /// Evicts oldest-first until the budgets hold, never touching `keep`.
    fn enforce_capacity(&self, keep: RecordId) -> Result<usize> {
        let limits = self.settings.limits();
        let mut evicted = 0;
        while !limits.allows(self.index.total_size(), self.index.count() as u64) {
            match self.index.evict_oldest(Some(keep))? {
                Some(_) => evicted += 1,
                None => {
                    warn!(
                        count = self.index.count(),
                        bytes = self.index.total_size(),
                        "Database over budget with no evictable record"
                    );
                    break;
                }
            }
        }
        Ok(evicted)
    }

    // ========================================================================
    // Delivery side
    // ========================================================================

    /// Locks the next record for delivery.
    pub fn lock_first(&self) -> Option<Record> {
        self.index.lock_first()
    }

    /// Reads a record's payload. A corrupt record is dropped from the index.
    pub fn read(&self, id: RecordId) -> Result<StoredRecord> {
        match self.store.read(id) {
            Ok(stored) => Ok(stored),
            Err(e @ StoreError::CorruptRecord { .. }) | Err(e @ StoreError::NotFound(_)) => {
                self.index.delete_locked(id)?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_payload(&self, id: RecordId) -> Result<Vec<u8>> {
        Ok(self.read(id)?.payload)
    }

    pub fn get(&self, id: RecordId) -> Option<Record> {
        self.index.get(id)
    }

    /// Deletes a record unless it is locked for delivery.
    pub fn delete(&self, id: RecordId) -> Result<bool> {
        self.index.delete(id)
    }

    /// Deletes a record whose delivery lock the caller holds.
    pub fn delete_locked(&self, id: RecordId) -> Result<bool> {
        self.index.delete_locked(id)
    }

    pub fn count(&self) -> usize {
        self.index.count()
    }

    pub fn total_size(&self) -> u64 {
        self.index.total_size()
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Purges every file that belongs to no indexed record.
    pub fn reconcile(&self) -> Result<usize> {
        let live: HashSet<RecordId> = self.index.ids().into_iter().collect();
        Ok(self.store.reconcile(&live)?)
    }

    /// Returns whether the files on disk fit the budgets.
    pub fn validate_consistency(&self) -> bool {
        self.store.validate()
    }

    /// Deletes every record.
    pub fn clear(&self) -> Result<()> {
        self.index.clear()
    }
}
