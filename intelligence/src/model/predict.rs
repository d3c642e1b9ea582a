//! Online and offline scoring

use chrono::{DateTime, Utc};
use metrics::{histogram, increment_counter};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use poolsentry_dataplane::utils::{read_jsonl, write_jsonl};
use poolsentry_dataplane::{PoolFeatureRow, Protocol, FEATURE_NAMES};

use super::isolation_forest::IsolationForest;
use crate::config::DEFAULT_MODEL_PATH;
use crate::error::{IntelligenceError, Result};
use crate::feature_store::{FeatureMap, FeatureStoreClient};
use crate::telemetry::{MODEL_CACHE_LOADS_TOTAL, PREDICTIONS_TOTAL, PREDICTION_ERRORS_TOTAL, PREDICTION_SCORE};

/// Model input order
pub const FEATURE_LIST: [&str; 13] = FEATURE_NAMES;

/// Score at or above which a pool is anomalous
pub const DEFAULT_THRESHOLD: f64 = 3.0;

/// Load-once cache of forests keyed by path
#[derive(Default)]
pub struct ModelCache {
    models: RwLock<HashMap<PathBuf, Arc<IsolationForest>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached forest for `path`, loading it on first use
    pub fn get(&self, path: &Path) -> Result<Arc<IsolationForest>> {
        if let Some(model) = self.models.read().get(path) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(model.clone());
        }

        let mut models = self.models.write();
        if let Some(model) = models.get(path) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(model.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let model = Arc::new(IsolationForest::load(path)?);
        increment_counter!(MODEL_CACHE_LOADS_TOTAL);
        info!(
            path = %path.display(),
            n_estimators = model.n_estimators(),
            features = model.n_features(),
            "Model loaded"
        );
        models.insert(path.to_path_buf(), model.clone());
        Ok(model)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

static SHARED_MODELS: Lazy<Arc<ModelCache>> = Lazy::new(|| Arc::new(ModelCache::new()));

/// Process-wide model cache
pub fn shared_model_cache() -> Arc<ModelCache> {
    SHARED_MODELS.clone()
}

/// `MODEL_PATH`, or the default artifact location
pub fn model_path_from_env() -> PathBuf {
    std::env::var("MODEL_PATH")
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH))
}

/// Forest at `MODEL_PATH`, loaded once per process
pub fn shared_model() -> Result<Arc<IsolationForest>> {
    SHARED_MODELS.get(&model_path_from_env())
}

/// Verdict for one pool. Failures carry `error` and a zero score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub pool_id: String,
    pub score: f64,
    pub is_anomaly: bool,
    pub threshold: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features_used: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features_missing: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionResult {
    fn failed(pool_id: &str, threshold: f64, error: &IntelligenceError) -> Self {
        error!(pool_id = pool_id, error = %error, "Prediction failed");
        increment_counter!(PREDICTION_ERRORS_TOTAL, "category" => error.category());
        Self {
            pool_id: pool_id.to_string(),
            score: 0.0,
            is_anomaly: false,
            threshold,
            features_used: None,
            features_missing: None,
            error: Some(error.to_string()),
        }
    }
}

/// Anomaly score of a single row: `-score_samples`, higher is more anomalous
pub fn anomaly_score(model: &IsolationForest, row: &[f64]) -> Result<f64> {
    Ok(-model.score_row(row)?)
}

/// Feature vector in `FEATURE_LIST` order; absent names take `default`
pub fn feature_vector(features: &FeatureMap, default: f64) -> Vec<f64> {
    FEATURE_LIST
        .iter()
        .map(|name| features.get(*name).copied().unwrap_or(default))
        .collect()
}

/// Scores pools from online features
pub struct Predictor {
    store: Arc<FeatureStoreClient>,
    models: Arc<ModelCache>,
    model_path: PathBuf,
}

impl Predictor {
    pub fn new<P: Into<PathBuf>>(store: Arc<FeatureStoreClient>, models: Arc<ModelCache>, model_path: P) -> Self {
        Self {
            store,
            models,
            model_path: model_path.into(),
        }
    }

    /// Predictor over the shared feature store client and model cache
    pub fn shared() -> Result<Self> {
        Ok(Self::new(
            crate::feature_store::shared_client()?,
            shared_model_cache(),
            model_path_from_env(),
        ))
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// The cached forest
    pub fn model(&self) -> Result<Arc<IsolationForest>> {
        self.models.get(&self.model_path)
    }

    fn score_features(&self, pool_id: &str, features: &FeatureMap, threshold: f64, default: f64) -> Result<PredictionResult> {
        let vector = feature_vector(features, default);
        let model = self.model()?;
        let score = anomaly_score(&model, &vector)?;
        let is_anomaly = score >= threshold;

        histogram!(PREDICTION_SCORE, score);
        increment_counter!(PREDICTIONS_TOTAL, "verdict" => if is_anomaly { "anomaly" } else { "normal" });
        info!(
            "Prediction for pool_id '{}': score={:.4}, is_anomaly={}",
            pool_id, score, is_anomaly
        );

        Ok(PredictionResult {
            pool_id: pool_id.to_string(),
            score,
            is_anomaly,
            threshold,
            features_used: Some(features.len()),
            features_missing: Some(FEATURE_LIST.len().saturating_sub(features.len())),
            error: None,
        })
    }

    /// Read a pool's features and score them. Never fails; errors are
    /// reported inside the result.
    pub async fn predict_from_feature_store(
        &self,
        pool_id: &str,
        threshold: f64,
        default_feature_value: f64,
    ) -> PredictionResult {
        let outcome = match self
            .store
            .read_features(pool_id, &FEATURE_LIST, Some(default_feature_value))
            .await
        {
            Ok(features) => self.score_features(pool_id, &features, threshold, default_feature_value),
            Err(e) => Err(e),
        };
        outcome.unwrap_or_else(|e| PredictionResult::failed(pool_id, threshold, &e))
    }

    /// Score several pools with one batched read; results follow `pool_ids`
    pub async fn predict_batch(
        &self,
        pool_ids: &[String],
        threshold: f64,
        default_feature_value: f64,
    ) -> Vec<PredictionResult> {
        let features = match self
            .store
            .read_features_batch(pool_ids, &FEATURE_LIST, Some(default_feature_value))
            .await
        {
            Ok(features) => features,
            Err(e) => {
                return pool_ids
                    .iter()
                    .map(|id| PredictionResult::failed(id, threshold, &e))
                    .collect()
            }
        };

        pool_ids
            .iter()
            .map(|id| {
                let empty = FeatureMap::new();
                let pool_features = features.get(id).unwrap_or(&empty);
                self.score_features(id, pool_features, threshold, default_feature_value)
                    .unwrap_or_else(|e| PredictionResult::failed(id, threshold, &e))
            })
            .collect()
    }
}

/// One scored row of an offline feature file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflinePrediction {
    pub dex: Protocol,
    pub pool_id: String,
    pub hour_ts: DateTime<Utc>,
    pub score: f64,
    pub is_anomaly: bool,
    /// `-1` outlier, `1` inlier, from the forest's own offset
    pub label: i8,
}

/// Score every row of a feature JSONL file and write prediction JSONL
pub fn score_feature_file(model: &IsolationForest, input: &Path, output: &Path, threshold: f64) -> Result<usize> {
    let (rows, skipped): (Vec<PoolFeatureRow>, usize) = read_jsonl(input)?;
    let matrix: Vec<Vec<f64>> = rows.iter().map(|r| r.vector(0.0)).collect();
    let scores = model.score_samples(&matrix)?;
    let labels = model.predict(&matrix)?;

    let predictions: Vec<OfflinePrediction> = rows
        .into_iter()
        .zip(scores.into_iter().zip(labels))
        .map(|(row, (score, label))| OfflinePrediction {
            dex: row.dex,
            pool_id: row.pool_id,
            hour_ts: row.hour_ts,
            score: -score,
            is_anomaly: -score >= threshold,
            label,
        })
        .collect();

    write_jsonl(output, &predictions)?;
    let outliers = predictions.iter().filter(|p| p.label == -1).count();
    info!(
        rows = predictions.len(),
        skipped = skipped,
        outliers = outliers,
        output = %output.display(),
        "Batch scoring complete"
    );
    Ok(predictions.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_store::client::MockOnlineServingApi;
    use crate::feature_store::types::{FeatureValue, ReadFeatureValuesResponse};
    use crate::model::isolation_forest::IsolationForestParams;
    use crate::model::training::synthetic_training_set;
    use poolsentry_dataplane::utils::RetryConfig;
    use std::time::Duration;

    fn write_model(dir: &Path) -> PathBuf {
        let x = synthetic_training_set(200, 9);
        let names = FEATURE_LIST.iter().map(|s| s.to_string()).collect();
        let params = IsolationForestParams {
            n_estimators: 25,
            ..Default::default()
        };
        let path = dir.join("iforest.json");
        IsolationForest::fit(&x, names, &params).unwrap().save(&path).unwrap();
        path
    }

    fn store(api: MockOnlineServingApi) -> Arc<FeatureStoreClient> {
        let retry = RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            backoff_multiplier: 2.0,
            deadline: None,
        };
        Arc::new(FeatureStoreClient::new(Arc::new(api), "entity").with_retry(retry))
    }

    fn partial_response(entity_id: &str) -> ReadFeatureValuesResponse {
        ReadFeatureValuesResponse::from_values(
            entity_id,
            vec![
                ("volume_usd", Some(FeatureValue::Double(1_000_000.0))),
                ("tvl_usd", Some(FeatureValue::Double(5_000_000.0))),
                ("tx_count", Some(FeatureValue::Int64(150))),
            ],
        )
    }

    #[test]
    fn test_model_cache_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path());
        let cache = ModelCache::new();

        let a = cache.get(&path).unwrap();
        let b = cache.get(&path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!((cache.misses(), cache.hits()), (1, 1));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_model_cache_missing_file() {
        let cache = ModelCache::new();
        let err = cache.get(Path::new("/nonexistent/model.json")).unwrap_err();
        assert_eq!(err.to_string(), "Model file not found: /nonexistent/model.json");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_feature_vector_order() {
        let mut features = FeatureMap::new();
        features.insert("day_of_week".into(), 6.0);
        features.insert("volume_usd".into(), 10.0);
        let vector = feature_vector(&features, -1.0);
        assert_eq!(vector.len(), 13);
        assert_eq!(vector[0], 10.0);
        assert_eq!(vector[1], -1.0);
        assert_eq!(vector[12], 6.0);
    }

    #[tokio::test]
    async fn test_predict_from_feature_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path());

        let mut api = MockOnlineServingApi::new();
        api.expect_read_feature_values()
            .times(1)
            .returning(|req| Ok(partial_response(&req.entity_id)));

        let predictor = Predictor::new(store(api), Arc::new(ModelCache::new()), path);
        let result = predictor.predict_from_feature_store("0xpool", 0.0, 0.0).await;

        assert_eq!(result.pool_id, "0xpool");
        assert!(result.error.is_none());
        assert!(result.score > 0.0 && result.score <= 1.0);
        assert!(result.is_anomaly);
        assert_eq!(result.features_used, Some(13));
        assert_eq!(result.features_missing, Some(0));
    }

    #[tokio::test]
    async fn test_threshold_boundary_and_default_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path());

        let mut api = MockOnlineServingApi::new();
        api.expect_read_feature_values()
            .returning(|req| Ok(partial_response(&req.entity_id)));
        let predictor = Predictor::new(store(api), Arc::new(ModelCache::new()), path);

        let first = predictor.predict_from_feature_store("0xpool", DEFAULT_THRESHOLD, 0.0).await;
        assert!(!first.is_anomaly);

        let at_boundary = predictor.predict_from_feature_store("0xpool", first.score, 0.0).await;
        assert!(at_boundary.is_anomaly);
    }

    #[tokio::test]
    async fn test_missing_model_yields_error_result() {
        let mut api = MockOnlineServingApi::new();
        api.expect_read_feature_values()
            .returning(|req| Ok(partial_response(&req.entity_id)));

        let predictor = Predictor::new(store(api), Arc::new(ModelCache::new()), "/nonexistent/model.json");
        let result = predictor.predict_from_feature_store("0xpool", 3.0, 0.0).await;

        assert_eq!(result.score, 0.0);
        assert!(!result.is_anomaly);
        assert_eq!(result.threshold, 3.0);
        assert_eq!(result.error.as_deref(), Some("Model file not found: /nonexistent/model.json"));

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("features_used").is_none());
    }

    #[tokio::test]
    async fn test_predict_batch_keeps_request_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path());

        let mut api = MockOnlineServingApi::new();
        api.expect_streaming_read_feature_values()
            .times(1)
            .returning(|req| {
                Ok(req
                    .entity_ids
                    .iter()
                    .rev()
                    .map(|id| partial_response(id))
                    .collect())
            });

        let predictor = Predictor::new(store(api), Arc::new(ModelCache::new()), path);
        let ids = vec!["0xb".to_string(), "0xa".to_string()];
        let results = predictor.predict_batch(&ids, 3.0, 0.0).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].pool_id, "0xb");
        assert_eq!(results[1].pool_id, "0xa");
        assert_eq!(results[0].score, results[1].score);
    }

    #[tokio::test]
    async fn test_predict_batch_repeated_pool_scores_served_features() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path());

        let mut api = MockOnlineServingApi::new();
        api.expect_streaming_read_feature_values()
            .withf(|req| req.entity_ids == vec!["0xa".to_string()])
            .times(1)
            .returning(|_| Ok(vec![partial_response("0xa")]));
        api.expect_read_feature_values()
            .times(1)
            .returning(|req| Ok(partial_response(&req.entity_id)));

        let predictor = Predictor::new(store(api), Arc::new(ModelCache::new()), path);
        let ids = vec!["0xa".to_string(), "0xa".to_string()];
        let results = predictor.predict_batch(&ids, 3.0, 0.0).await;
        let single = predictor.predict_from_feature_store("0xa", 3.0, 0.0).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0].score, single.score);
    }

    #[test]
    fn test_shared_model_loads_from_model_path_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(dir.path());
        std::env::set_var("MODEL_PATH", &path);

        assert_eq!(model_path_from_env(), path);
        let first = shared_model().unwrap();
        let second = shared_model().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.n_features(), FEATURE_LIST.len());

        std::env::remove_var("MODEL_PATH");
    }

    #[test]
    fn test_score_feature_file() {
        let dir = tempfile::tempdir().unwrap();
        let model = IsolationForest::load(&write_model(dir.path())).unwrap();

        let rows: Vec<PoolFeatureRow> = synthetic_training_set(10, 3)
            .into_iter()
            .enumerate()
            .map(|(i, values)| PoolFeatureRow {
                dex: Protocol::Uniswap,
                pool_id: format!("0xpool{}", i),
                hour_ts: Utc::now(),
                features: FEATURE_LIST
                    .iter()
                    .map(|s| s.to_string())
                    .zip(values)
                    .collect(),
            })
            .collect();
        let input = dir.path().join("features.jsonl");
        let output = dir.path().join("out/predictions.jsonl");
        write_jsonl(&input, &rows).unwrap();

        assert_eq!(score_feature_file(&model, &input, &output, 3.0).unwrap(), 10);
        let (predictions, _): (Vec<OfflinePrediction>, usize) = read_jsonl(&output).unwrap();
        assert_eq!(predictions.len(), 10);
        assert!(predictions.iter().all(|p| p.label == 1 || p.label == -1));
        assert!(predictions.iter().all(|p| !p.is_anomaly));
    }
}
