//! Operating system information attached to crash reports
//!
//! Never includes hostname or username.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsInfo {
    pub os: String,
    pub family: String,
    /// Kernel release, empty where `/proc/version` is unavailable
    pub kernel: String,
    pub arch: String,
    pub locale: String,
}

impl OsInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            kernel: kernel_release(),
            arch: std::env::consts::ARCH.to_string(),
            locale: std::env::var("LC_ALL")
                .or_else(|_| std::env::var("LANG"))
                .unwrap_or_default(),
        }
    }
}

fn kernel_release() -> String {
    std::fs::read_to_string("/proc/version")
        .ok()
        .and_then(|v| parse_kernel_release(&v))
        .unwrap_or_default()
}

/// `Linux version 6.1.0-18-amd64 (...)` -> `6.1.0-18-amd64`
fn parse_kernel_release(version: &str) -> Option<String> {
    version.split_whitespace().nth(2).map(String::from)
}
