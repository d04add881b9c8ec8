//! Domain entities and rules
//!
//! This module contains the core domain types for ferrytrace:
//! - Newtypes for record and batch identifiers
//! - `Record`, the unit of durable storage, and its ordering policies
//! - Telemetry events and the attribute merge rule
//! - Domain-specific error types

pub mod errors;
pub mod event;
pub mod newtypes;
pub mod record;

// Re-export commonly used types
pub use errors::DomainError;
pub use event::{
    is_empty_value, merge_attributes, Attributes, RequeuePolicy, SummedEvent, UniqueEvent,
};
pub use newtypes::{BatchId, RecordId};
pub use record::{PromotionOrder, Record, RecordState, RetryOrder};
