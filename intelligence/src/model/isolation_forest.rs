//! Isolation Forest
//!
//! Scores follow the scikit-learn convention: `score_samples` is the
//! negated anomaly score, so higher means more normal and the anomaly score
//! of a row is `-score_samples`.

use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use poolsentry_dataplane::utils::percentile;

use crate::error::{IntelligenceError, Result};

const EULER_GAMMA: f64 = 0.5772156649;

/// Largest subsample drawn per tree
pub const DEFAULT_MAX_SAMPLES: usize = 256;

/// Expected fraction of outliers in the training data
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contamination {
    /// Fixed offset of -0.5
    Auto,
    /// Offset at this percentile of training scores, in (0, 0.5]
    Fraction(f64),
}

impl fmt::Display for Contamination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contamination::Auto => write!(f, "auto"),
            Contamination::Fraction(v) => write!(f, "{}", v),
        }
    }
}

impl FromStr for Contamination {
    type Err = IntelligenceError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Contamination::Auto);
        }
        let fraction: f64 = s
            .trim()
            .parse()
            .map_err(|_| IntelligenceError::training(format!("invalid contamination: {}", s)))?;
        if fraction > 0.0 && fraction <= 0.5 {
            Ok(Contamination::Fraction(fraction))
        } else {
            Err(IntelligenceError::training(format!(
                "contamination must be in (0, 0.5], got {}",
                fraction
            )))
        }
    }
}

/// Training parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForestParams {
    pub n_estimators: usize,
    /// `None` draws `min(256, n)` rows per tree
    pub max_samples: Option<usize>,
    pub contamination: Contamination,
    pub random_state: u64,
}

impl Default for IsolationForestParams {
    fn default() -> Self {
        Self {
            n_estimators: 200,
            max_samples: None,
            contamination: Contamination::Auto,
            random_state: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// One isolation tree stored as a flat arena, root at index 0
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow(x: &[Vec<f64>], rows: Vec<usize>, depth_limit: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow_node(x, rows, 0, depth_limit, rng);
        tree
    }

    fn grow_node(
        &mut self,
        x: &[Vec<f64>],
        rows: Vec<usize>,
        depth: usize,
        depth_limit: usize,
        rng: &mut StdRng,
    ) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });

        if depth >= depth_limit || rows.len() <= 1 {
            return index;
        }

        let width = x[rows[0]].len();
        let splittable: Vec<(usize, f64, f64)> = (0..width)
            .filter_map(|feature| {
                let (min, max) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                    (lo.min(x[r][feature]), hi.max(x[r][feature]))
                });
                (max > min).then_some((feature, min, max))
            })
            .collect();

        if splittable.is_empty() {
            return index;
        }

        let (feature, min, max) = splittable[rng.gen_range(0..splittable.len())];
        let threshold = rng.gen_range(min..max);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| x[r][feature] <= threshold);

        let left = self.grow_node(x, left_rows, depth + 1, depth_limit, rng);
        let right = self.grow_node(x, right_rows, depth + 1, depth_limit, rng);
        self.nodes[index] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        index
    }

    fn path_length(&self, row: &[f64]) -> f64 {
        let mut index = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if row[*feature] <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average path length of an unsuccessful search in a binary search tree of `n` points
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

/// A fitted Isolation Forest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    feature_names: Vec<String>,
    max_samples: usize,
    contamination: Contamination,
    random_state: u64,
    offset: f64,
    trees: Vec<IsolationTree>,
}

impl IsolationForest {
    /// Fit on the rows of `x`, whose columns are `feature_names`
    pub fn fit(x: &[Vec<f64>], feature_names: Vec<String>, params: &IsolationForestParams) -> Result<Self> {
        if x.is_empty() {
            return Err(IntelligenceError::training("cannot fit on an empty matrix"));
        }
        if params.n_estimators == 0 {
            return Err(IntelligenceError::training("n_estimators must be positive"));
        }
        let width = feature_names.len();
        if let Some(row) = x.iter().find(|row| row.len() != width) {
            return Err(IntelligenceError::FeatureMismatch {
                expected: width,
                actual: row.len(),
            });
        }
        if x.iter().flatten().any(|v| !v.is_finite()) {
            return Err(IntelligenceError::training("training matrix contains non-finite values"));
        }

        let max_samples = params
            .max_samples
            .unwrap_or(DEFAULT_MAX_SAMPLES)
            .clamp(1, x.len());
        let depth_limit = (max_samples.max(2) as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(params.random_state);

        let trees = (0..params.n_estimators)
            .map(|_| {
                let rows = sample(&mut rng, x.len(), max_samples).into_vec();
                IsolationTree::grow(x, rows, depth_limit, &mut rng)
            })
            .collect();

        let mut forest = Self {
            feature_names,
            max_samples,
            contamination: params.contamination,
            random_state: params.random_state,
            offset: -0.5,
            trees,
        };

        if let Contamination::Fraction(fraction) = params.contamination {
            let mut scores = forest.score_samples(x)?;
            scores.sort_by(|a, b| a.total_cmp(b));
            forest.offset = percentile(&scores, fraction);
        }

        Ok(forest)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn n_estimators(&self) -> usize {
        self.trees.len()
    }

    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    pub fn contamination(&self) -> Contamination {
        self.contamination
    }

    pub fn random_state(&self) -> u64 {
        self.random_state
    }

    /// Threshold subtracted by `decision_function`
    pub fn offset(&self) -> f64 {
        self.offset
    }

    fn check_width(&self, row: &[f64]) -> Result<()> {
        if row.len() != self.n_features() {
            return Err(IntelligenceError::FeatureMismatch {
                expected: self.n_features(),
                actual: row.len(),
            });
        }
        Ok(())
    }

    /// Score of a single row; higher is more normal
    pub fn score_row(&self, row: &[f64]) -> Result<f64> {
        self.check_width(row)?;
        let mean_depth =
            self.trees.iter().map(|t| t.path_length(row)).sum::<f64>() / self.trees.len() as f64;
        let normalizer = average_path_length(self.max_samples);
        let exponent = if normalizer > 0.0 { mean_depth / normalizer } else { 0.0 };
        Ok(-(2f64.powf(-exponent)))
    }

    /// Scores of every row; higher is more normal
    pub fn score_samples(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        x.iter().map(|row| self.score_row(row)).collect()
    }

    /// `score_samples - offset`; negative values are outliers
    pub fn decision_function(&self, x: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self
            .score_samples(x)?
            .into_iter()
            .map(|s| s - self.offset)
            .collect())
    }

    /// `-1` for outliers, `1` for inliers
    pub fn predict(&self, x: &[Vec<f64>]) -> Result<Vec<i8>> {
        Ok(self
            .decision_function(x)?
            .into_iter()
            .map(|d| if d < 0.0 { -1 } else { 1 })
            .collect())
    }

    /// Write the forest as JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    /// Read a forest written by `save`
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(IntelligenceError::ModelNotFound(path.to_path_buf()));
        }
        let file = std::io::BufReader::new(std::fs::File::open(path)?);
        let forest: Self = serde_json::from_reader(file)?;
        if forest.trees.is_empty() {
            return Err(IntelligenceError::model(format!(
                "model at {} has no trees",
                path.display()
            )));
        }
        Ok(forest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("f{}", i)).collect()
    }

    fn gaussian_cluster(n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        (0..n)
            .map(|_| vec![normal.sample(&mut rng), normal.sample(&mut rng)])
            .collect()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(0), 0.0);
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        assert!((average_path_length(3) - 1.207392).abs() < 1e-5);
        assert!((average_path_length(256) - 10.244771).abs() < 1e-5);
    }

    #[test]
    fn test_outlier_scores_lower() {
        let x = gaussian_cluster(300, 7);
        let forest = IsolationForest::fit(&x, names(2), &IsolationForestParams::default()).unwrap();

        let center = forest.score_row(&[0.0, 0.0]).unwrap();
        let outlier = forest.score_row(&[12.0, -12.0]).unwrap();
        assert!(outlier < center);
        assert!(-outlier > 0.5);
        assert_eq!(forest.predict(&[vec![12.0, -12.0]]).unwrap(), vec![-1]);
        assert_eq!(forest.max_samples(), 256);
        assert_eq!(forest.n_estimators(), 200);
    }

    #[test]
    fn test_constant_data_scores_half() {
        let x = vec![vec![1.0, 2.0]; 20];
        let forest = IsolationForest::fit(&x, names(2), &IsolationForestParams::default()).unwrap();
        assert_eq!(forest.score_row(&[1.0, 2.0]).unwrap(), -0.5);
        assert_eq!(forest.score_row(&[100.0, 2.0]).unwrap(), -0.5);
    }

    #[test]
    fn test_contamination_sets_offset() {
        let x = gaussian_cluster(200, 11);
        let params = IsolationForestParams {
            n_estimators: 100,
            contamination: Contamination::Fraction(0.1),
            ..Default::default()
        };
        let forest = IsolationForest::fit(&x, names(2), &params).unwrap();
        assert!(forest.offset() != -0.5);

        let outliers = forest.predict(&x).unwrap().into_iter().filter(|p| *p == -1).count();
        assert!((18..=22).contains(&outliers), "outliers = {}", outliers);
    }

    #[test]
    fn test_fit_is_deterministic() {
        let x = gaussian_cluster(100, 3);
        let a = IsolationForest::fit(&x, names(2), &IsolationForestParams::default()).unwrap();
        let b = IsolationForest::fit(&x, names(2), &IsolationForestParams::default()).unwrap();
        assert_eq!(a.score_samples(&x).unwrap(), b.score_samples(&x).unwrap());
    }

    #[test]
    fn test_feature_mismatch() {
        let x = gaussian_cluster(50, 1);
        let forest = IsolationForest::fit(&x, names(2), &IsolationForestParams::default()).unwrap();
        let err = forest.score_row(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, IntelligenceError::FeatureMismatch { expected: 2, actual: 3 }));

        let err = IsolationForest::fit(&x, names(3), &IsolationForestParams::default()).unwrap_err();
        assert!(matches!(err, IntelligenceError::FeatureMismatch { .. }));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/model.json");
        let x = gaussian_cluster(64, 5);
        let forest = IsolationForest::fit(&x, names(2), &IsolationForestParams::default()).unwrap();
        forest.save(&path).unwrap();

        let loaded = IsolationForest::load(&path).unwrap();
        assert_eq!(loaded.feature_names(), forest.feature_names());
        let before = forest.score_samples(&x).unwrap();
        let after = loaded.score_samples(&x).unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_load_missing_model() {
        let err = IsolationForest::load(Path::new("/nonexistent/iforest.json")).unwrap_err();
        assert_eq!(err.to_string(), "Model file not found: /nonexistent/iforest.json");
    }

    #[test]
    fn test_contamination_parsing() {
        assert_eq!("auto".parse::<Contamination>().unwrap(), Contamination::Auto);
        assert_eq!("0.1".parse::<Contamination>().unwrap(), Contamination::Fraction(0.1));
        assert!("0.7".parse::<Contamination>().is_err());
        assert!("lots".parse::<Contamination>().is_err());
    }
}
