//! Error types for event batching

use ferrytrace_core::domain::DomainError;
use ferrytrace_submit::SubmitError;
use thiserror::Error;

/// Errors returned when recording or flushing events
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Event name or metric group is empty
    #[error("Invalid event name: {0:?}")]
    InvalidName(String),

    /// The batcher already holds its maximum number of events
    #[error("Event batcher is full ({max} events)")]
    CapacityReached { max: u32 },

    #[error(transparent)]
    Submit(#[from] SubmitError),
}

impl From<DomainError> for EventError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidName(name) => EventError::InvalidName(name),
            other => EventError::InvalidName(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, EventError>;

#[cfg(test)]
mod tests {
    use ferrytrace_core::ports::StreamKind;

    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            EventError::CapacityReached { max: 350 }.to_string(),
            "Event batcher is full (350 events)"
        );
        assert_eq!(
            EventError::from(SubmitError::Stopped(StreamKind::UniqueEvents)).to_string(),
            "Submission scheduler for unique_events has stopped"
        );
    }

    #[test]
    fn test_domain_name_error_maps_to_invalid_name() {
        let err = EventError::from(DomainError::InvalidName(" ".to_string()));
        assert_eq!(err, EventError::InvalidName(" ".to_string()));
    }
}
