//! Telemetry events
//!
//! Two kinds of events are accumulated in memory between submissions:
//! - [`UniqueEvent`]: at most one per name, refreshed on every re-add
//! - [`SummedEvent`]: one entry per occurrence, counted server-side
//!
//! Attribute maps follow one rule on every write: an empty value (`null`
//! or `""`) never replaces anything, so a non-empty attribute can only be
//! overwritten by another non-empty value.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::DomainError;

/// Attribute map attached to events
pub type Attributes = BTreeMap<String, Value>;

/// Returns true for values that count as "absent"
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Merge `update` into `target`, skipping empty values
pub fn merge_attributes(target: &mut Attributes, update: Attributes) {
    for (key, value) in update {
        if is_empty_value(&value) {
            continue;
        }
        target.insert(key, value);
    }
}

fn validated_name(name: impl Into<String>) -> Result<String, DomainError> {
    let name = name.into();
    if name.trim().is_empty() {
        return Err(DomainError::InvalidName(name));
    }
    Ok(name)
}

// ============================================================================
// UniqueEvent
// ============================================================================

/// An event that exists at most once per name in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueEvent {
    pub name: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub attributes: Attributes,
}

impl UniqueEvent {
    /// Creates a unique event; fails with `InvalidName` for an empty name.
    pub fn new(
        name: impl Into<String>,
        timestamp: DateTime<Utc>,
        attributes: Attributes,
    ) -> Result<Self, DomainError> {
        let mut event = Self {
            name: validated_name(name)?,
            timestamp,
            attributes: Attributes::new(),
        };
        merge_attributes(&mut event.attributes, attributes);
        Ok(event)
    }

    /// Refresh timestamp and attributes in place.
    pub fn refresh(&mut self, timestamp: DateTime<Utc>, attributes: Attributes) {
        self.timestamp = timestamp;
        merge_attributes(&mut self.attributes, attributes);
    }
}

// ============================================================================
// SummedEvent
// ============================================================================

/// An event counted once per occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummedEvent {
    pub metric_group: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub attributes: Attributes,
}

impl SummedEvent {
    pub fn new(
        metric_group: impl Into<String>,
        timestamp: DateTime<Utc>,
        attributes: Attributes,
    ) -> Result<Self, DomainError> {
        let mut event = Self {
            metric_group: validated_name(metric_group)?,
            timestamp,
            attributes: Attributes::new(),
        };
        merge_attributes(&mut event.attributes, attributes);
        Ok(event)
    }
}

// ============================================================================
// RequeuePolicy
// ============================================================================

/// What happens to the events of an abandoned batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeuePolicy {
    /// Discard the events
    #[default]
    Drop,
    /// Put the events back at the front of the queue when capacity allows
    RequeueFront,
}

impl fmt::Display for RequeuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequeuePolicy::Drop => "drop",
            RequeuePolicy::RequeueFront => "requeue_front",
        };
        write!(f, "{s}")
    }
}

impl FromStr for RequeuePolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(RequeuePolicy::Drop),
            "requeue_front" | "requeue" => Ok(RequeuePolicy::RequeueFront),
            other => Err(DomainError::UnknownPolicy(other.to_string())),
        }
    }
}
