//! Isolation Forest model: training, registry and scoring

pub mod isolation_forest;
pub mod predict;
pub mod registry;
pub mod training;

pub use isolation_forest::{Contamination, IsolationForest, IsolationForestParams};
pub use predict::{
    score_feature_file, shared_model, shared_model_cache, ModelCache, PredictionResult, Predictor,
    DEFAULT_THRESHOLD, FEATURE_LIST,
};
pub use registry::{ModelRegistry, ModelVersion};
pub use training::{synthetic_training_set, train, ModelMetadata, TrainedModel};
