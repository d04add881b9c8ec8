//! ferrytrace Store - Durable offline record queue
//!
//! Provides:
//! - `RecordStore`: one flat directory of record manifests, payloads and
//!   attachment copies, with atomic writes, orphan reconciliation and
//!   budget validation
//! - `RecordIndex`: in-memory view of the stored records ordered by retry
//!   bucket, with per-record delivery locks
//! - `Database`: startup recovery and newest-wins capacity enforcement over
//!   the two

pub mod database;
pub mod error;
pub mod record_index;
pub mod record_store;

pub use database::{Database, DatabaseSettings};
pub use error::{IndexError, StoreError};
pub use record_index::{Promotion, RecordIndex};
pub use record_store::{RecordStore, StoreLimits, StoredRecord};
