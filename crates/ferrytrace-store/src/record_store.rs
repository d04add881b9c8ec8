//! On-disk record persistence
//!
//! Every record lives in one flat directory as a set of files sharing the
//! record id as prefix:
//!
//! ```text
//! <id>-record.json              manifest, written last
//! <id>-payload.bin              opaque serialized payload
//! <id>-attachment-<n>-<name>    copies of the attached files
//! ```
//!
//! - **Atomic writes**: each file is written as `temp_<name>` and renamed
//!   into place, and the manifest goes last, so a record is only visible
//!   once all of its files are complete.
//! - **Corruption**: a manifest that cannot be parsed, or whose payload is
//!   missing or has the wrong length, makes the record invalid; its files
//!   are deleted when it is read.
//! - **Reconciliation**: files that belong to no live record, or that do not
//!   follow the naming scheme, are orphans and get purged.
//!
//! The store does not serialize concurrent calls; [`RecordIndex`](crate::RecordIndex)
//! and [`Database`](crate::Database) provide the discipline.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferrytrace_core::domain::{Record, RecordId};
use ferrytrace_core::ports::IClock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StoreError};

const MANIFEST_SUFFIX: &str = "record.json";
const PAYLOAD_SUFFIX: &str = "payload.bin";
const ATTACHMENT_MARKER: &str = "attachment-";
const TEMP_PREFIX: &str = "temp_";

/// Length of a hyphenated UUID, the prefix of every record file
const ID_LEN: usize = 36;

// ============================================================================
// Limits and file naming
// ============================================================================

/// Size and count budgets of the store (0 = unlimited)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_bytes: u64,
    pub max_records: u32,
}

impl StoreLimits {
    pub const fn unlimited() -> Self {
        Self {
            max_bytes: 0,
            max_records: 0,
        }
    }

    /// Returns true if `bytes` and `records` fit the budgets.
    pub fn allows(&self, bytes: u64, records: u64) -> bool {
        let bytes_ok = self.max_bytes == 0 || bytes <= self.max_bytes;
        let records_ok = self.max_records == 0 || records <= u64::from(self.max_records);
        bytes_ok && records_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Manifest,
    Payload,
    Attachment,
}

/// Splits `<id>-<suffix>` into the record id and the kind of file.
fn parse_file_name(name: &str) -> Option<(RecordId, FileKind)> {
    let id: RecordId = name.get(..ID_LEN)?.parse().ok()?;
    let rest = name.get(ID_LEN..)?.strip_prefix('-')?;
    let kind = if rest == MANIFEST_SUFFIX {
        FileKind::Manifest
    } else if rest == PAYLOAD_SUFFIX {
        FileKind::Payload
    } else if rest.starts_with(ATTACHMENT_MARKER) && rest.len() > ATTACHMENT_MARKER.len() {
        FileKind::Attachment
    } else {
        return None;
    };
    Some((id, kind))
}

/// True if `name` is a bare file name of one of `id`'s attachment copies.
fn is_attachment_of(id: RecordId, name: &str) -> bool {
    !name.contains(['/', '\\'])
        && matches!(parse_file_name(name), Some((owner, FileKind::Attachment)) if owner == id)
}

fn manifest_name(id: RecordId) -> String {
    format!("{id}-{MANIFEST_SUFFIX}")
}

fn payload_name(id: RecordId) -> String {
    format!("{id}-{PAYLOAD_SUFFIX}")
}

fn attachment_name(id: RecordId, index: usize, source: &Path) -> String {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().replace(['/', '\\'], "_"))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "file".to_string());
    format!("{id}-{ATTACHMENT_MARKER}{index}-{file_name}")
}

/// Write `bytes` to `temp_<name>` and rename it to `name`.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> io::Result<u64> {
    let tmp = dir.join(format!("{TEMP_PREFIX}{name}"));
    let result = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, dir.join(name)));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map(|()| bytes.len() as u64)
}

/// Copy `source` to `temp_<name>` and rename it to `name`.
fn copy_atomic(source: &Path, dir: &Path, name: &str) -> io::Result<u64> {
    let tmp = dir.join(format!("{TEMP_PREFIX}{name}"));
    let result = fs::copy(source, &tmp).and_then(|len| {
        fs::rename(&tmp, dir.join(name))?;
        Ok(len)
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

// ============================================================================
// Manifest and StoredRecord
// ============================================================================

/// On-disk description of one record
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    id: RecordId,
    created_at: DateTime<Utc>,
    payload: String,
    payload_len: u64,
    attachments: Vec<String>,
    /// Bytes of payload plus attachment copies
    data_size: u64,
}

/// A record together with its payload bytes
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub record: Record,
    pub payload: Vec<u8>,
}

// ============================================================================
// RecordStore
// ============================================================================

/// Flat-directory persistence for [`Record`]s
pub struct RecordStore {
    dir: PathBuf,
    limits: StoreLimits,
    clock: Arc<dyn IClock>,
    total_bytes: AtomicU64,
    record_count: AtomicU64,
}

impl RecordStore {
    /// Opens (creating if needed) the store directory and measures what is
    /// already on disk.
    pub fn open(dir: impl Into<PathBuf>, limits: StoreLimits, clock: Arc<dyn IClock>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let (bytes, records) = scan_usage(&dir)?;
        info!(
            dir = %dir.display(),
            bytes,
            records,
            "Opened record store"
        );
        Ok(Self {
            dir,
            limits,
            clock,
            total_bytes: AtomicU64::new(bytes),
            record_count: AtomicU64::new(records),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    /// Bytes currently attributed to stored files
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Number of records with a manifest on disk
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // add
    // ------------------------------------------------------------------------

    /// Persists `payload` and copies of `attachments` as a new record.
    ///
    /// Attachments that do not exist are skipped. On any failure every file
    /// written for the record is removed and `IoFailure` is returned.
    #[instrument(skip(self, payload, attachments), fields(bytes = payload.len(), attachments = attachments.len()))]
    pub fn add(&self, payload: &[u8], attachments: &[PathBuf]) -> Result<Record> {
        let id = RecordId::new();
        let mut written = Vec::new();

        match self.write_record(id, payload, attachments, &mut written) {
            Ok(record) => {
                self.total_bytes.fetch_add(record.size(), Ordering::AcqRel);
                self.record_count.fetch_add(1, Ordering::AcqRel);
                debug!(record_id = %id, size = record.size(), "Record stored");
                Ok(record)
            }
            Err(e) => {
                for path in &written {
                    let _ = fs::remove_file(path);
                }
                warn!(record_id = %id, error = %e, "Failed to store record, partial files removed");
                Err(e)
            }
        }
    }

    fn write_record(
        &self,
        id: RecordId,
        payload: &[u8],
        attachments: &[PathBuf],
        written: &mut Vec<PathBuf>,
    ) -> Result<Record> {
        let payload_file = payload_name(id);
        written.push(self.dir.join(&payload_file));
        let mut data_size = write_atomic(&self.dir, &payload_file, payload)?;

        let mut attachment_files = Vec::with_capacity(attachments.len());
        for (index, source) in attachments.iter().enumerate() {
            if !source.is_file() {
                warn!(record_id = %id, path = %source.display(), "Attachment not found, skipping");
                continue;
            }
            let name = attachment_name(id, index, source);
            written.push(self.dir.join(&name));
            data_size += copy_atomic(source, &self.dir, &name)?;
            attachment_files.push(name);
        }

        let manifest = Manifest {
            id,
            created_at: self.clock.now(),
            payload: payload_file,
            payload_len: payload.len() as u64,
            attachments: attachment_files,
            data_size,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        let manifest_file = manifest_name(id);
        written.push(self.dir.join(&manifest_file));
        let manifest_len = write_atomic(&self.dir, &manifest_file, &manifest_bytes)?;

        Ok(self.record_from(manifest, manifest_len))
    }

    fn record_from(&self, manifest: Manifest, manifest_len: u64) -> Record {
        let attachments = manifest
            .attachments
            .iter()
            .map(|name| self.dir.join(name))
            .collect();
        Record::new(
            manifest.id,
            manifest.created_at,
            manifest.data_size + manifest_len,
            manifest.payload_len,
            attachments,
        )
    }

    // ------------------------------------------------------------------------
    // read / load
    // ------------------------------------------------------------------------

    /// Reads a record and its payload.
    ///
    /// Returns `NotFound` when no manifest exists and `CorruptRecord` (after
    /// deleting the record's files) when the manifest or payload is invalid.
    pub fn read(&self, id: RecordId) -> Result<StoredRecord> {
        let record = self.load(id)?;
        let payload_path = self.dir.join(payload_name(id));
        let payload = match fs::read(&payload_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.discard_corrupt(id, "payload missing"));
            }
            Err(e) => return Err(e.into()),
        };
        if payload.len() as u64 != record.payload_len() {
            return Err(self.discard_corrupt(id, "payload length mismatch"));
        }
        Ok(StoredRecord { record, payload })
    }

    /// Loads a record's metadata, checking that its payload is intact.
    pub fn load(&self, id: RecordId) -> Result<Record> {
        let manifest_path = self.dir.join(manifest_name(id));
        let bytes = match fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };

        let manifest: Manifest = match serde_json::from_slice(&bytes) {
            Ok(m) => m,
            Err(e) => return Err(self.discard_corrupt(id, &format!("unreadable manifest: {e}"))),
        };
        if manifest.id != id {
            return Err(self.discard_corrupt(id, "manifest id mismatch"));
        }
        if manifest.payload != payload_name(id) {
            return Err(self.discard_corrupt(id, "foreign payload file"));
        }
        if !manifest
            .attachments
            .iter()
            .all(|name| is_attachment_of(id, name))
        {
            return Err(self.discard_corrupt(id, "foreign attachment file"));
        }

        match fs::metadata(self.dir.join(payload_name(id))) {
            Ok(meta) if meta.len() == manifest.payload_len => {}
            Ok(_) => return Err(self.discard_corrupt(id, "payload length mismatch")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(self.discard_corrupt(id, "payload missing"));
            }
            Err(e) => return Err(e.into()),
        }

        Ok(self.record_from(manifest, bytes.len() as u64))
    }

    /// Loads every valid record, oldest first. Corrupt records are deleted
    /// and skipped.
    pub fn load_all(&self) -> Result<Vec<Record>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((id, FileKind::Manifest)) = parse_file_name(&name.to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort();

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load(id) {
                Ok(record) => records.push(record),
                Err(StoreError::CorruptRecord { .. }) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    fn discard_corrupt(&self, id: RecordId, reason: &str) -> StoreError {
        warn!(record_id = %id, reason, "Discarding corrupt record");
        if let Err(e) = self.remove_files(id) {
            warn!(record_id = %id, error = %e, "Failed to remove corrupt record files");
        }
        StoreError::CorruptRecord {
            id,
            reason: reason.to_string(),
        }
    }

    // ------------------------------------------------------------------------
    // delete / clear
    // ------------------------------------------------------------------------

    /// Removes every file of a record. Returns false if it was not stored.
    pub fn delete(&self, id: RecordId) -> Result<bool> {
        let existed = self.remove_files(id)?;
        if existed {
            debug!(record_id = %id, "Record deleted");
        }
        Ok(existed)
    }

    /// Removes the manifest first, then every other file carrying the id.
    fn remove_files(&self, id: RecordId) -> io::Result<bool> {
        let manifest_path = self.dir.join(manifest_name(id));
        let manifest_len = match fs::metadata(&manifest_path) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        if let Some(len) = manifest_len {
            match fs::remove_file(&manifest_path) {
                Ok(()) => {
                    self.release(len, 1);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        let prefix = format!("{id}-");
        let temp_prefix = format!("{TEMP_PREFIX}{id}-");
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.starts_with(&prefix) || name.starts_with(&temp_prefix)) {
                continue;
            }
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(entry.path()) {
                Ok(()) => self.release(len, 0),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        Ok(manifest_len.is_some())
    }

    fn release(&self, bytes: u64, records: u64) {
        let _ = self
            .total_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(bytes)));
        if records > 0 {
            let _ = self
                .record_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(records))
                });
        }
    }

    /// Deletes every file in the store directory. Returns the number removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        self.total_bytes.store(0, Ordering::Release);
        self.record_count.store(0, Ordering::Release);
        info!(removed, "Record store cleared");
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // reconcile / validate
    // ------------------------------------------------------------------------

    /// Deletes every file that is not part of a record in `live`.
    ///
    /// Temp files, unrecognized names and files of unknown ids are removed.
    /// Subdirectories are left alone. Returns the number of files deleted.
    #[instrument(skip(self, live), fields(live = live.len()))]
    pub fn reconcile(&self, live: &HashSet<RecordId>) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let orphan = match parse_file_name(&name) {
                Some((id, _)) => !live.contains(&id),
                None => true,
            };
            if !orphan {
                continue;
            }

            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let is_manifest = matches!(parse_file_name(&name), Some((_, FileKind::Manifest)));
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    self.release(len, u64::from(is_manifest));
                    removed += 1;
                    debug!(file = %name, "Removed orphaned file");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %name, error = %e, "Failed to remove orphaned file"),
            }
        }
        if removed > 0 {
            info!(removed, "Reconciled record store");
        }
        Ok(removed)
    }

    /// Returns whether the files on disk fit the configured budgets.
    pub fn validate(&self) -> bool {
        match scan_usage(&self.dir) {
            Ok((bytes, records)) => {
                let ok = self.limits.allows(bytes, records);
                if !ok {
                    warn!(
                        bytes,
                        records,
                        max_bytes = self.limits.max_bytes,
                        max_records = self.limits.max_records,
                        "Record store exceeds its budget"
                    );
                }
                ok
            }
            Err(e) => {
                warn!(error = %e, "Failed to scan record store");
                false
            }
        }
    }
}

/// Total bytes of all files and the number of manifests in `dir`.
fn scan_usage(dir: &Path) -> io::Result<(u64, u64)> {
    let mut bytes = 0;
    let mut records = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        bytes += meta.len();
        if let Some((_, FileKind::Manifest)) = parse_file_name(&entry.file_name().to_string_lossy()) {
            records += 1;
        }
    }
    Ok((bytes, records))
}
