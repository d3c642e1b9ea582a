//! Offline training over engineered feature rows

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use poolsentry_dataplane::utils::{read_jsonl, simple_moving_average};
use poolsentry_dataplane::{PoolFeatureRow, FEATURE_NAMES};

use super::isolation_forest::{IsolationForest, IsolationForestParams};
use crate::error::{IntelligenceError, Result};

/// Days of history used for training
pub const DEFAULT_TRAINING_DAYS: i64 = 30;

/// Forest file inside an artifact directory
pub const MODEL_FILE: &str = "model.json";

/// Metadata file inside an artifact directory
pub const METADATA_FILE: &str = "schema/metadata.json";

pub const MODEL_TYPE: &str = "IsolationForest";

/// Description written next to every trained forest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub feature_names: Vec<String>,
    pub model_type: String,
    pub version: String,
    pub training_samples: usize,
    #[serde(default)]
    pub mean_anomaly_score: Option<f64>,
    #[serde(default)]
    pub trained_at: Option<DateTime<Utc>>,
}

/// A fitted forest and its metadata
#[derive(Debug, Clone)]
pub struct TrainedModel {
    pub forest: IsolationForest,
    pub metadata: ModelMetadata,
}

impl TrainedModel {
    /// Write `model.json` and `schema/metadata.json` under `dir`
    pub fn write_artifact(&self, dir: &Path) -> Result<PathBuf> {
        let model_path = dir.join(MODEL_FILE);
        self.forest.save(&model_path)?;

        let metadata_path = dir.join(METADATA_FILE);
        if let Some(parent) = metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&metadata_path, serde_json::to_string_pretty(&self.metadata)?)?;

        info!(artifact = %dir.display(), version = %self.metadata.version, "Artifact ready");
        Ok(model_path)
    }
}

/// Read the metadata of an artifact directory
pub fn read_metadata(dir: &Path) -> Result<ModelMetadata> {
    let content = std::fs::read_to_string(dir.join(METADATA_FILE))?;
    Ok(serde_json::from_str(&content)?)
}

/// Feature rows within `days` of the newest row
pub fn load_training_rows(path: &Path, days: i64) -> Result<Vec<PoolFeatureRow>> {
    let (rows, skipped): (Vec<PoolFeatureRow>, usize) = read_jsonl(path)?;
    if skipped > 0 {
        warn!(path = %path.display(), skipped = skipped, "Skipped malformed feature rows");
    }

    let newest = rows
        .iter()
        .map(|r| r.hour_ts)
        .max()
        .ok_or_else(|| IntelligenceError::training(format!("no feature rows in {}", path.display())))?;
    let cutoff = newest - Duration::days(days);

    let window: Vec<PoolFeatureRow> = rows.into_iter().filter(|r| r.hour_ts >= cutoff).collect();
    info!(
        rows = window.len(),
        newest = %newest,
        days = days,
        "Training window loaded"
    );
    Ok(window)
}

/// Model input matrix in `FEATURE_NAMES` order; identifier columns are dropped
pub fn feature_matrix(rows: &[PoolFeatureRow]) -> Vec<Vec<f64>> {
    rows.iter().map(|row| row.vector(0.0)).collect()
}

/// Bootstrap dataset shaped like real pool features
pub fn synthetic_training_set(n: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let width = FEATURE_NAMES.len();

    (0..n)
        .map(|_| {
            let mut row: Vec<f64> = (0..width).map(|_| StandardNormal.sample(&mut rng)).collect();
            for value in row.iter_mut().take(3) {
                *value = value.abs() * 1_000_000.0;
            }
            row[3] = row[3].abs().trunc() * 100.0;
            row[width - 2] = rng.gen_range(0..24) as f64;
            row[width - 1] = rng.gen_range(0..7) as f64;
            row
        })
        .collect()
}

/// Fit a forest over `x` and describe it
pub fn train(x: &[Vec<f64>], version: &str, params: &IsolationForestParams) -> Result<TrainedModel> {
    let feature_names: Vec<String> = FEATURE_NAMES.iter().map(|s| s.to_string()).collect();
    let forest = IsolationForest::fit(x, feature_names.clone(), params)?;

    let anomaly_scores: Vec<f64> = forest.score_samples(x)?.into_iter().map(|s| -s).collect();
    let mean_anomaly_score = simple_moving_average(&anomaly_scores);
    info!(
        samples = x.len(),
        n_estimators = params.n_estimators,
        contamination = %params.contamination,
        mean_anomaly_score = mean_anomaly_score,
        "Model trained"
    );

    Ok(TrainedModel {
        forest,
        metadata: ModelMetadata {
            feature_names,
            model_type: MODEL_TYPE.to_string(),
            version: version.to_string(),
            training_samples: x.len(),
            mean_anomaly_score: Some(mean_anomaly_score),
            trained_at: Some(Utc::now()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::isolation_forest::Contamination;
    use chrono::TimeZone;
    use poolsentry_dataplane::{utils::write_jsonl, Protocol};
    use std::collections::BTreeMap;

    fn row(pool: &str, day: u32) -> PoolFeatureRow {
        let features: BTreeMap<String, f64> = FEATURE_NAMES
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), (i as f64) + day as f64))
            .collect();
        PoolFeatureRow {
            dex: Protocol::Uniswap,
            pool_id: pool.to_string(),
            hour_ts: Utc.with_ymd_and_hms(2024, 10, day, 0, 0, 0).unwrap(),
            features,
        }
    }

    #[test]
    fn test_training_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.jsonl");
        let rows: Vec<_> = (1..=20).map(|d| row("0xpool", d)).collect();
        write_jsonl(&path, &rows).unwrap();

        let window = load_training_rows(&path, 5).unwrap();
        assert_eq!(window.len(), 6);
        assert!(window.iter().all(|r| r.hour_ts.format("%d").to_string().as_str() >= "15"));
    }

    #[test]
    fn test_empty_training_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.jsonl");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            load_training_rows(&path, 30),
            Err(IntelligenceError::Training { .. })
        ));
    }

    #[test]
    fn test_feature_matrix_order() {
        let matrix = feature_matrix(&[row("0xpool", 1)]);
        assert_eq!(matrix[0].len(), 13);
        assert_eq!(matrix[0][0], 1.0);
        assert_eq!(matrix[0][12], 13.0);
    }

    #[test]
    fn test_synthetic_shape() {
        let x = synthetic_training_set(500, 42);
        assert_eq!(x.len(), 500);
        for row in &x {
            assert_eq!(row.len(), 13);
            assert!(row[0] >= 0.0 && row[1] >= 0.0 && row[2] >= 0.0);
            assert_eq!(row[3] % 100.0, 0.0);
            assert!((0.0..24.0).contains(&row[11]) && row[11].fract() == 0.0);
            assert!((0.0..7.0).contains(&row[12]) && row[12].fract() == 0.0);
        }
        assert_eq!(x, synthetic_training_set(500, 42));
    }

    #[test]
    fn test_train_and_write_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let x = synthetic_training_set(300, 1);
        let params = IsolationForestParams {
            n_estimators: 50,
            contamination: Contamination::Fraction(0.1),
            ..Default::default()
        };
        let trained = train(&x, "v1", &params).unwrap();
        let model_path = trained.write_artifact(dir.path()).unwrap();

        assert!(model_path.ends_with("model.json"));
        let metadata = read_metadata(dir.path()).unwrap();
        assert_eq!(metadata.model_type, "IsolationForest");
        assert_eq!(metadata.version, "v1");
        assert_eq!(metadata.training_samples, 300);
        assert_eq!(metadata.feature_names.len(), 13);
        assert!(metadata.mean_anomaly_score.unwrap() > 0.0);
        assert_eq!(IsolationForest::load(&model_path).unwrap().n_estimators(), 50);
    }
}
