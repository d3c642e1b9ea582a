//! PoolSentry Intelligence Layer
//!
//! Turns engineered pool features into anomaly verdicts.
//!
//! ## Inputs:
//! 1. **feature store**: latest per-pool features served online
//! 2. **dataplane**: feature rows written by the ingestion pipeline
//!
//! ## Output:
//! - **PredictionResult**: anomaly score and verdict per pool

pub mod config;
pub mod dashboard;
pub mod error;
pub mod feature_store;
pub mod gateway;
pub mod model;
pub mod telemetry;

pub use config::{FeatureStoreConfig, IntelligenceConfig};
pub use error::{IntelligenceError, Result};
pub use feature_store::{FeatureStoreClient, OnlineServingApi};
pub use model::{IsolationForest, PredictionResult, Predictor};

/// Version of the intelligence layer
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
