//! Domain error types
//!
//! Errors raised while validating domain values: identifiers, event names
//! and settings that cannot be represented.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Event name or metric group is empty
    #[error("Invalid event name: {0:?}")]
    InvalidName(String),

    /// Unknown ordering or policy keyword
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidId("xyz".to_string());
        assert_eq!(err.to_string(), "Invalid ID format: xyz");

        let err = DomainError::InvalidName(String::new());
        assert_eq!(err.to_string(), "Invalid event name: \"\"");

        let err = DomainError::UnknownPolicy("sideways".to_string());
        assert_eq!(err.to_string(), "Unknown policy: sideways");
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(
            DomainError::InvalidName("a".into()),
            DomainError::InvalidName("a".into())
        );
        assert_ne!(
            DomainError::InvalidName("a".into()),
            DomainError::InvalidId("a".into())
        );
    }
}
