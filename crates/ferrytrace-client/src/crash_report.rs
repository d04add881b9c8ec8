//! Panic capture into the record database
//!
//! The panic hook serializes a [`CrashReport`] as JSON and stores it as a
//! regular record, so it is delivered by the report stream like any other
//! report, on this run or the next one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ferrytrace_core::domain::Record;
use ferrytrace_store::Database;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::os_info::OsInfo;

/// A structured crash report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub message: String,
    pub location: String,
    pub thread: Option<String>,
    pub backtrace: String,
    pub os_info: OsInfo,
}

impl CrashReport {
    pub fn new(message: &str, location: &str, backtrace: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            message: message.to_string(),
            location: location.to_string(),
            thread: std::thread::current().name().map(String::from),
            backtrace: backtrace.to_string(),
            os_info: OsInfo::collect(),
        }
    }

    /// Writes the report into `db` as a new record.
    pub fn save(&self, db: &Database) -> Result<Record> {
        let payload = serde_json::to_vec(self)?;
        Ok(db.add(&payload, &[])?)
    }
}

/// Installs a panic hook that stores a crash report in `db`.
///
/// The previously installed hook still runs afterwards.
pub fn install_crash_reporter(db: Arc<Database>) {
    let previous_hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();

        let backtrace = std::backtrace::Backtrace::force_capture().to_string();
        let report = CrashReport::new(&message, &location, &backtrace);

        if let Err(e) = report.save(&db) {
            eprintln!("Failed to store crash report: {e}");
        }

        previous_hook(panic_info);
    }));
}

#[cfg(test)]
mod tests {
    use ferrytrace_core::ports::SystemClock;
    use ferrytrace_store::DatabaseSettings;

    use super::*;

    #[test]
    fn test_crash_report_creation() {
        let report = CrashReport::new("test panic", "lib.rs:42:1", "fake backtrace");
        assert!(!report.id.is_nil());
        assert_eq!(report.message, "test panic");
        assert_eq!(report.location, "lib.rs:42:1");
        assert_eq!(report.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_save_stores_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(DatabaseSettings::new(dir.path()), Arc::new(SystemClock)).unwrap();
        let report = CrashReport::new("boom", "main.rs:10:5", "");

        let record = report.save(&db).unwrap();
        assert_eq!(db.count(), 1);

        let payload = db.read_payload(record.id()).unwrap();
        let loaded: CrashReport = serde_json::from_slice(&payload).unwrap();
        assert_eq!(loaded.message, "boom");
        assert_eq!(loaded.id, report.id);
    }
}
