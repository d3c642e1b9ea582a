//! Configuration management for the intelligence layer
//!
//! Layered like the dataplane: built-in defaults, optional `config/*` files,
//! then `INTELLIGENCE__*` environment variables. Feature-store coordinates
//! come from the conventional `PROJECT_ID` / `FEATURESTORE_NAME` / `REGION`
//! variables instead.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use url::Url;

use crate::error::{IntelligenceError, Result};

/// Entity type that holds per-pool features
pub use poolsentry_dataplane::ENTITY_TYPE_ID;

/// Region used when `REGION` is unset
pub const DEFAULT_REGION: &str = "asia-northeast1";

/// Model artifact used when `MODEL_PATH` is unset
pub const DEFAULT_MODEL_PATH: &str = "/model/iforest.json";

/// Intelligence layer configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IntelligenceConfig {
    /// Scoring defaults and artifact locations
    pub model: ModelConfig,

    /// HTTP gateway
    pub gateway: GatewayConfig,

    /// Prometheus exporter
    pub metrics: MetricsConfig,

    /// Retry policy for online reads
    pub serving: ServingConfig,
}

/// Model and scoring settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Serialized forest loaded for online scoring
    pub model_path: String,

    /// Score at or above which a pool is anomalous
    pub threshold: f64,

    /// Value substituted for features the store did not return
    pub default_feature_value: f64,

    /// Root of the file-system model registry
    pub registry_dir: String,

    /// Registered model name
    pub registered_name: String,

    /// Alias promoted after training
    pub alias: String,
}

/// Gateway settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    pub bind_address: String,

    /// Origin prefixes that receive CORS headers
    pub allowed_origins: Vec<String>,
}

/// Metrics exporter settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Prometheus listener, disabled when unset
    pub prometheus_bind_address: Option<String>,
}

/// Online read retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServingConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub deadline_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                model_path: DEFAULT_MODEL_PATH.to_string(),
                threshold: 3.0,
                default_feature_value: 0.0,
                registry_dir: "models/registry".to_string(),
                registered_name: "pool_iforest".to_string(),
                alias: "production".to_string(),
            },
            gateway: GatewayConfig {
                bind_address: "0.0.0.0:8080".to_string(),
                allowed_origins: Vec::new(),
            },
            metrics: MetricsConfig {
                prometheus_bind_address: None,
            },
            serving: ServingConfig {
                initial_backoff_ms: 1000,
                max_backoff_ms: 5000,
                backoff_multiplier: 2.0,
                deadline_ms: 10_000,
                request_timeout_ms: 10_000,
            },
        }
    }
}

impl IntelligenceConfig {
    /// Load configuration from files and environment.
    ///
    /// `MODEL_PATH` and `ALLOWED_ORIGINS` override the layered values.
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&IntelligenceConfig::default())?;
        let config = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name("config/intelligence").required(false))
            .add_source(
                File::with_name(&format!(
                    "config/intelligence.{}",
                    std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into())
                ))
                .required(false),
            )
            .add_source(File::with_name("config/intelligence.local").required(false))
            .add_source(Environment::with_prefix("INTELLIGENCE").separator("__"))
            .build()?;

        let mut loaded: Self = config.try_deserialize()?;
        loaded.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(loaded)
    }

    /// Apply the plain environment variables shared with the feature-store setup
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("MODEL_PATH").filter(|p| !p.is_empty()) {
            self.model.model_path = path;
        }
        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            self.gateway.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file (for generating examples)
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !self.model.threshold.is_finite() {
            return Err(ConfigError::Message("threshold must be finite".into()));
        }
        if self.gateway.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Message(format!(
                "Invalid gateway bind address: {}",
                self.gateway.bind_address
            )));
        }
        if let Some(addr) = &self.metrics.prometheus_bind_address {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(ConfigError::Message(format!(
                    "Invalid Prometheus bind address: {}",
                    addr
                )));
            }
        }
        if self.serving.backoff_multiplier < 1.0 || self.serving.deadline_ms == 0 {
            return Err(ConfigError::Message("Invalid serving retry policy".into()));
        }
        Ok(())
    }

    /// Retry policy for online reads
    pub fn serving_retry(&self) -> poolsentry_dataplane::utils::RetryConfig {
        use std::time::Duration;
        poolsentry_dataplane::utils::RetryConfig {
            // bounded by the deadline
            max_attempts: u32::MAX,
            initial_delay: Duration::from_millis(self.serving.initial_backoff_ms),
            max_delay: Duration::from_millis(self.serving.max_backoff_ms),
            backoff_multiplier: self.serving.backoff_multiplier,
            deadline: Some(Duration::from_millis(self.serving.deadline_ms)),
        }
    }
}

/// Coordinates of the online feature store
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FeatureStoreConfig {
    pub project: String,
    pub region: String,
    pub featurestore_name: String,
    pub entity_type_id: String,

    /// Overrides `https://{region}-aiplatform.googleapis.com`
    pub api_endpoint: Option<String>,

    /// Static bearer token; the metadata server is used when unset
    pub access_token: Option<String>,
}

impl FeatureStoreConfig {
    /// Read `PROJECT_ID`, `FEATURESTORE_NAME`, `REGION`,
    /// `FEATURESTORE_API_ENDPOINT` and `FEATURESTORE_ACCESS_TOKEN`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env` over an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let project = non_empty("PROJECT_ID").ok_or_else(|| {
            IntelligenceError::Environment("PROJECT_ID environment variable is required".into())
        })?;
        let featurestore_name = non_empty("FEATURESTORE_NAME").ok_or_else(|| {
            IntelligenceError::Environment("FEATURESTORE_NAME environment variable is required".into())
        })?;

        Ok(Self {
            project,
            region: non_empty("REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            featurestore_name,
            entity_type_id: ENTITY_TYPE_ID.to_string(),
            api_endpoint: non_empty("FEATURESTORE_API_ENDPOINT"),
            access_token: non_empty("FEATURESTORE_ACCESS_TOKEN"),
        })
    }

    /// `projects/{p}/locations/{r}/featurestores/{fs}/entityTypes/{et}`
    pub fn entity_type_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/featurestores/{}/entityTypes/{}",
            self.project, self.region, self.featurestore_name, self.entity_type_id
        )
    }

    /// Base URL of the serving API
    pub fn endpoint(&self) -> Result<Url> {
        let raw = self
            .api_endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}-aiplatform.googleapis.com", self.region));
        Url::parse(&raw).map_err(|e| {
            IntelligenceError::Config(ConfigError::Message(format!(
                "Invalid feature store endpoint {}: {}",
                raw, e
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = IntelligenceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.threshold, 3.0);
        assert_eq!(config.model.model_path, "/model/iforest.json");
        assert_eq!(config.model.registered_name, "pool_iforest");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = IntelligenceConfig::default();
        config.apply_env_overrides(lookup(&[
            ("MODEL_PATH", "/tmp/m.json"),
            ("ALLOWED_ORIGINS", "https://app.example, ,http://localhost"),
        ]));
        assert_eq!(config.model.model_path, "/tmp/m.json");
        assert_eq!(
            config.gateway.allowed_origins,
            vec!["https://app.example".to_string(), "http://localhost".to_string()]
        );
    }

    #[test]
    fn test_save_and_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intelligence.yaml");
        let mut config = IntelligenceConfig::default();
        config.metrics.prometheus_bind_address = Some("127.0.0.1:9100".to_string());

        config.save_to_file(&path).unwrap();
        let loaded = IntelligenceConfig::from_file(&path).unwrap();

        assert_eq!(loaded.metrics.prometheus_bind_address, config.metrics.prometheus_bind_address);
        assert_eq!(loaded.serving.deadline_ms, 10_000);
    }

    #[test]
    fn test_feature_store_config_from_env() {
        let config = FeatureStoreConfig::from_lookup(lookup(&[
            ("PROJECT_ID", "test-project"),
            ("FEATURESTORE_NAME", "test-featurestore"),
            ("REGION", "us-central1"),
        ]))
        .unwrap();

        assert_eq!(config.region, "us-central1");
        assert_eq!(
            config.entity_type_path(),
            "projects/test-project/locations/us-central1/featurestores/test-featurestore/entityTypes/dex_liquidity"
        );
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "https://us-central1-aiplatform.googleapis.com/"
        );
    }

    #[test]
    fn test_feature_store_config_defaults_region() {
        let config = FeatureStoreConfig::from_lookup(lookup(&[
            ("PROJECT_ID", "p"),
            ("FEATURESTORE_NAME", "fs"),
        ]))
        .unwrap();
        assert_eq!(config.region, "asia-northeast1");
    }

    #[test]
    fn test_feature_store_config_missing_vars() {
        let err = FeatureStoreConfig::from_lookup(lookup(&[("FEATURESTORE_NAME", "fs")])).unwrap_err();
        assert_eq!(err.to_string(), "PROJECT_ID environment variable is required");

        let err = FeatureStoreConfig::from_lookup(lookup(&[("PROJECT_ID", "p")])).unwrap_err();
        assert_eq!(err.to_string(), "FEATURESTORE_NAME environment variable is required");
    }
}
