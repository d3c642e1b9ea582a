//! Error types for the dataplane module

use thiserror::Error;

/// Result type alias for dataplane operations
pub type Result<T> = std::result::Result<T, DataplaneError>;

/// Comprehensive error types for dataplane operations
#[derive(Error, Debug)]
pub enum DataplaneError {
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },

    #[error("GraphQL errors from {endpoint}: {errors}")]
    GraphQl { endpoint: String, errors: String },

    #[error("Fetch error: {message}")]
    Fetch { message: String },

    #[error("Invalid interval end: {0}")]
    InvalidInterval(String),

    #[error("Invalid value for {field} in record {record_id}: {value}")]
    InvalidValue {
        field: String,
        record_id: String,
        value: String,
    },

    #[error("Missing environment variable '{variable}' referenced by {location}")]
    MissingEnvVar { variable: String, location: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataplaneError {
    /// Create a new fetch error
    pub fn fetch<S: Into<String>>(message: S) -> Self {
        Self::Fetch {
            message: message.into(),
        }
    }

    /// Create a new invalid value error
    pub fn invalid_value<F, R, V>(field: F, record_id: R, value: V) -> Self
    where
        F: Into<String>,
        R: Into<String>,
        V: Into<String>,
    {
        Self::InvalidValue {
            field: field.into(),
            record_id: record_id.into(),
            value: value.into(),
        }
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            DataplaneError::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            DataplaneError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            DataplaneError::UnknownProtocol(_) => "validation",
            DataplaneError::Config(_) => "config",
            DataplaneError::Network(_) => "network",
            DataplaneError::Serialization(_) => "serialization",
            DataplaneError::Yaml(_) => "serialization",
            DataplaneError::Io(_) => "io",
            DataplaneError::HttpStatus { .. } => "network",
            DataplaneError::GraphQl { .. } => "upstream",
            DataplaneError::Fetch { .. } => "fetch",
            DataplaneError::InvalidInterval(_) => "validation",
            DataplaneError::InvalidValue { .. } => "validation",
            DataplaneError::MissingEnvVar { .. } => "config",
            DataplaneError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        let unavailable = DataplaneError::HttpStatus {
            status: 503,
            endpoint: "http://subgraph".to_string(),
        };
        let not_found = DataplaneError::HttpStatus {
            status: 404,
            endpoint: "http://subgraph".to_string(),
        };
        assert!(unavailable.is_retryable());
        assert!(!not_found.is_retryable());
        assert!(!DataplaneError::fetch("bad page").is_retryable());
    }

    #[test]
    fn test_category() {
        let err = DataplaneError::MissingEnvVar {
            variable: "GRAPH_API_KEY".to_string(),
            location: "uniswap.api_key".to_string(),
        };
        assert_eq!(err.category(), "config");
        assert_eq!(
            err.to_string(),
            "Missing environment variable 'GRAPH_API_KEY' referenced by uniswap.api_key"
        );
    }
}
