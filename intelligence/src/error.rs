//! Error types for the intelligence layer

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for intelligence operations
pub type Result<T> = std::result::Result<T, IntelligenceError>;

/// Comprehensive error types for feature serving, training and scoring
#[derive(Error, Debug)]
pub enum IntelligenceError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A required environment variable is unset; the message is shown as-is
    #[error("{0}")]
    Environment(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Dataplane error: {0}")]
    Dataplane(#[from] poolsentry_dataplane::DataplaneError),

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Feature serving returned {status}: {message}")]
    FeatureServing { status: u16, message: String },

    #[error("Model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("Feature count mismatch: model expects {expected}, got {actual}")]
    FeatureMismatch { expected: usize, actual: usize },

    #[error("Model error: {message}")]
    Model { message: String },

    #[error("Training error: {message}")]
    Training { message: String },

    #[error("Registry error: {message}")]
    Registry { message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntelligenceError {
    /// Create a model error
    pub fn model<S: Into<String>>(message: S) -> Self {
        Self::Model {
            message: message.into(),
        }
    }

    /// Create a training error
    pub fn training<S: Into<String>>(message: S) -> Self {
        Self::Training {
            message: message.into(),
        }
    }

    /// Create a registry error
    pub fn registry<S: Into<String>>(message: S) -> Self {
        Self::Registry {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Only transient serving failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IntelligenceError::DeadlineExceeded(_) | IntelligenceError::ServiceUnavailable(_)
        )
    }

    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            IntelligenceError::Config(_) | IntelligenceError::Environment(_) => "config",
            IntelligenceError::Serialization(_) | IntelligenceError::Yaml(_) => "serialization",
            IntelligenceError::Io(_) => "io",
            IntelligenceError::Http(_) => "network",
            IntelligenceError::Dataplane(e) => e.category(),
            IntelligenceError::DeadlineExceeded(_) => "deadline_exceeded",
            IntelligenceError::ServiceUnavailable(_) => "unavailable",
            IntelligenceError::FeatureServing { .. } => "feature_serving",
            IntelligenceError::ModelNotFound(_)
            | IntelligenceError::FeatureMismatch { .. }
            | IntelligenceError::Model { .. } => "model",
            IntelligenceError::Training { .. } => "training",
            IntelligenceError::Registry { .. } => "registry",
            IntelligenceError::InvalidRequest(_) => "validation",
            IntelligenceError::Internal(_) => "internal",
        }
    }
}
