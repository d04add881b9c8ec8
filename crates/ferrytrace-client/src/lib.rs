//! ferrytrace Client - The reporter context a host application embeds
//!
//! Provides:
//! - `Reporter`: opens the record database, runs the report and event
//!   schedulers, and fans their outcomes out to subscribers
//! - `QueueMetrics`: Prometheus counters for delivery outcomes
//! - `CrashReport`: panic capture written durably into the database
//! - `OsInfo`: non-identifying system information for crash reports
//! - `init_tracing`: subscriber setup from the logging configuration

pub mod crash_report;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod os_info;
pub mod reporter;

pub use crash_report::{install_crash_reporter, CrashReport};
pub use error::{ClientError, Result};
pub use logging::init_tracing;
pub use metrics::QueueMetrics;
pub use os_info::OsInfo;
pub use reporter::Reporter;
