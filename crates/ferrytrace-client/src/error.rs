//! Error types for the reporter context

use ferrytrace_core::config::ValidationError;
use ferrytrace_metrics::EventError;
use ferrytrace_store::IndexError;
use ferrytrace_submit::SubmitError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Invalid configuration: {}", join(.0))]
    InvalidConfig(Vec<ValidationError>),

    #[error("Record database error: {0}")]
    Database(#[from] IndexError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport setup failed: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("Metrics registry error: {0}")]
    Metrics(#[source] anyhow::Error),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Events(#[from] EventError),

    /// Event metrics were not enabled in the configuration
    #[error("Event metrics are disabled")]
    MetricsDisabled,
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, ClientError>;
