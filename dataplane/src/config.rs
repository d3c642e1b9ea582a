//! Configuration management for the dataplane

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use url::Url;

use crate::{DataplaneError, Protocol, Result};

/// Environment variable that points at an explicit protocols.yml
pub const PROTOCOL_CFG_ENV: &str = "PROTOCOL_CFG_PATH";

/// Fixed location inside the container image
pub const CONTAINER_PROTOCOL_CFG: &str = "/app/protocols.yml";

const PROTOCOL_CFG_FILE: &str = "protocols.yml";

/// Main configuration structure for the dataplane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataplaneConfig {
    /// Global settings
    pub global: GlobalConfig,

    /// Subgraph settings per protocol. Usually empty here and resolved
    /// from protocols.yml instead.
    #[serde(default)]
    pub protocols: HashMap<Protocol, ProtocolConfig>,

    /// Where raw, clean and feature files live
    pub storage: StorageConfig,

    /// Feature engineering windows
    pub features: FeatureConfig,
}

/// Global dataplane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Subgraph request timeout in seconds
    pub request_timeout_seconds: u64,

    /// Maximum attempts per subgraph page
    pub max_retries: u32,

    /// First retry delay in milliseconds
    pub retry_initial_delay_ms: u64,

    /// Upper bound on the retry delay in milliseconds
    pub retry_max_delay_ms: u64,
}

/// Subgraph settings for one protocol, as found in protocols.yml
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Endpoint with `{api_key}` and `{subgraph_id}` placeholders
    pub endpoint_template: String,

    /// The Graph gateway API key
    pub api_key: String,

    /// Subgraph deployment id
    pub subgraph_id: String,

    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page_size() -> u32 {
    1000
}

/// File locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of `{protocol}/*_pool.jsonl` raw files
    pub raw_dir: String,

    /// Clean table output
    pub clean_path: String,

    /// Feature rows output
    pub features_path: String,

    /// Sub-directory that receives archived duplicate raw files
    pub archive_dir_name: String,
}

/// Feature engineering windows, in hours
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub short_window_hours: i64,
    pub long_window_hours: i64,
    pub rate_lag_hours: i64,
}

impl ProtocolConfig {
    /// Endpoint with placeholders substituted
    pub fn endpoint(&self) -> String {
        self.endpoint_template
            .replace("{api_key}", &self.api_key)
            .replace("{subgraph_id}", &self.subgraph_id)
    }

    /// Validate the resolved endpoint and page size
    pub fn validate(&self, protocol: Protocol) -> std::result::Result<(), ConfigError> {
        let endpoint = self.endpoint();
        if Url::parse(&endpoint).is_err() {
            return Err(ConfigError::Message(format!(
                "Invalid subgraph endpoint for protocol {}: {}",
                protocol, endpoint
            )));
        }
        if self.page_size == 0 {
            return Err(ConfigError::Message(format!(
                "page_size must be greater than 0 for protocol {}",
                protocol
            )));
        }
        Ok(())
    }
}

impl DataplaneConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let defaults = Config::try_from(&DataplaneConfig::default())?;
        let config = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                File::with_name(&format!(
                    "config/{}",
                    std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into())
                ))
                .required(false),
            )
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("DATAPLANE").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.global.request_timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "request_timeout_seconds must be greater than 0".into(),
            ));
        }
        if self.global.max_retries == 0 {
            return Err(ConfigError::Message("max_retries must be greater than 0".into()));
        }

        let windows = &self.features;
        if windows.short_window_hours <= 0
            || windows.long_window_hours < windows.short_window_hours
            || windows.rate_lag_hours <= 0
        {
            return Err(ConfigError::Message(format!(
                "Invalid feature windows: short={}h long={}h lag={}h",
                windows.short_window_hours, windows.long_window_hours, windows.rate_lag_hours
            )));
        }

        for (protocol, cfg) in &self.protocols {
            cfg.validate(*protocol)?;
        }

        Ok(())
    }

    /// Subgraph settings for a protocol: inline config first, then protocols.yml
    pub fn protocol_config(&self, protocol: Protocol) -> Result<ProtocolConfig> {
        if let Some(cfg) = self.protocols.get(&protocol) {
            return Ok(cfg.clone());
        }
        let mut all = load_protocol_config()?;
        all.remove(&protocol).ok_or_else(|| {
            DataplaneError::Config(ConfigError::Message(format!(
                "protocols.yml has no entry for {}",
                protocol
            )))
        })
    }

    /// Retry policy for subgraph requests
    pub fn retry_config(&self) -> crate::utils::RetryConfig {
        crate::utils::RetryConfig {
            max_attempts: self.global.max_retries,
            initial_delay: std::time::Duration::from_millis(self.global.retry_initial_delay_ms),
            max_delay: std::time::Duration::from_millis(self.global.retry_max_delay_ms),
            backoff_multiplier: 2.0,
            deadline: None,
        }
    }
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig {
                log_level: "info".to_string(),
                request_timeout_seconds: 30,
                max_retries: 3,
                retry_initial_delay_ms: 1000,
                retry_max_delay_ms: 5000,
            },
            protocols: HashMap::new(),
            storage: StorageConfig {
                raw_dir: "data/raw".to_string(),
                clean_path: "data/clean/raw_clean_with_pool.jsonl".to_string(),
                features_path: "data/features/pool_features.jsonl".to_string(),
                archive_dir_name: "archived".to_string(),
            },
            features: FeatureConfig {
                short_window_hours: 6,
                long_window_hours: 24,
                rate_lag_hours: 24,
            },
        }
    }
}

/// Candidate protocols.yml paths in lookup order, duplicates removed
pub fn protocol_config_candidates(explicit: Option<PathBuf>, start_dir: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path);
    }
    candidates.push(PathBuf::from(CONTAINER_PROTOCOL_CFG));
    candidates.extend(start_dir.ancestors().map(|dir| dir.join(PROTOCOL_CFG_FILE)));

    let mut seen = std::collections::HashSet::new();
    candidates.retain(|path| seen.insert(path.clone()));
    candidates
}

/// First existing candidate
pub fn locate_protocol_config_in(candidates: &[PathBuf]) -> Result<PathBuf> {
    if let Some(found) = candidates.iter().find(|path| path.is_file()) {
        info!(path = %found.display(), "Using protocols.yml");
        return Ok(found.clone());
    }

    let searched = candidates
        .iter()
        .map(|path| format!("  - {}", path.display()))
        .collect::<Vec<_>>()
        .join("\n");
    Err(DataplaneError::Config(ConfigError::Message(format!(
        "protocols.yml not found. Searched:\n{}",
        searched
    ))))
}

/// Locate protocols.yml from `PROTOCOL_CFG_PATH`, the container path, then
/// the working directory and its ancestors
pub fn locate_protocol_config() -> Result<PathBuf> {
    let explicit = std::env::var_os(PROTOCOL_CFG_ENV).map(PathBuf::from);
    let cwd = std::env::current_dir()?;
    locate_protocol_config_in(&protocol_config_candidates(explicit, &cwd))
}

/// Load and expand the located protocols.yml
pub fn load_protocol_config() -> Result<HashMap<Protocol, ProtocolConfig>> {
    let path = locate_protocol_config()?;
    load_protocol_config_from(&path, |name| std::env::var(name).ok())
}

/// Parse a protocols.yml file, replacing `${NAME}` values through `lookup`.
/// Entries for protocols this build does not know are skipped.
pub fn load_protocol_config_from<F>(path: &Path, lookup: F) -> Result<HashMap<Protocol, ProtocolConfig>>
where
    F: Fn(&str) -> Option<String>,
{
    let text = std::fs::read_to_string(path)?;
    let raw: BTreeMap<String, BTreeMap<String, serde_yaml::Value>> = serde_yaml::from_str(&text)?;

    let mut resolved = HashMap::new();
    for (name, mut entries) in raw {
        for (key, value) in entries.iter_mut() {
            if let Some(expanded) = expand_env_reference(value, &lookup, &name, key)? {
                *value = serde_yaml::Value::String(expanded);
            }
        }

        let protocol: Protocol = match name.parse() {
            Ok(protocol) => protocol,
            Err(_) => {
                debug!(protocol = %name, "Skipping unknown protocol in protocols.yml");
                continue;
            }
        };
        let mapping = entries
            .into_iter()
            .map(|(k, v)| (serde_yaml::Value::String(k), v))
            .collect::<serde_yaml::Mapping>();
        let cfg: ProtocolConfig = serde_yaml::from_value(serde_yaml::Value::Mapping(mapping))?;
        resolved.insert(protocol, cfg);
    }

    Ok(resolved)
}

fn expand_env_reference<F>(
    value: &serde_yaml::Value,
    lookup: &F,
    protocol: &str,
    key: &str,
) -> Result<Option<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(text) = value.as_str() else {
        return Ok(None);
    };
    let Some(variable) = text.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) else {
        return Ok(None);
    };

    lookup(variable).map(Some).ok_or_else(|| DataplaneError::MissingEnvVar {
        variable: variable.to_string(),
        location: format!("{}.{}", protocol, key),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PROTOCOLS_YML: &str = r#"
uniswap:
  endpoint_template: "https://gateway.thegraph.com/api/{api_key}/subgraphs/id/{subgraph_id}"
  api_key: "${GRAPH_API_KEY}"
  subgraph_id: "5zvR82"
  page_size: 500
sushiswap:
  endpoint_template: "https://gateway.thegraph.com/api/{api_key}/subgraphs/id/{subgraph_id}"
  api_key: "${GRAPH_API_KEY}"
  subgraph_id: "7okunX"
curve:
  endpoint_template: "https://example.invalid"
"#;

    fn write_protocols(dir: &Path) -> PathBuf {
        let path = dir.join("protocols.yml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(PROTOCOLS_YML.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_default_config_validates() {
        let config = DataplaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_config().max_attempts, 3);
    }

    #[test]
    fn test_invalid_windows_rejected() {
        let mut config = DataplaneConfig::default();
        config.features.long_window_hours = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_substitution() {
        let cfg = ProtocolConfig {
            endpoint_template: "https://host/api/{api_key}/subgraphs/id/{subgraph_id}".to_string(),
            api_key: "k".to_string(),
            subgraph_id: "s".to_string(),
            page_size: 100,
        };
        assert_eq!(cfg.endpoint(), "https://host/api/k/subgraphs/id/s");
        assert!(cfg.validate(Protocol::Uniswap).is_ok());
    }

    #[test]
    fn test_load_protocol_config_expands_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_protocols(dir.path());

        let protocols = load_protocol_config_from(&path, |name| {
            (name == "GRAPH_API_KEY").then(|| "secret".to_string())
        })
        .unwrap();

        assert_eq!(protocols.len(), 2);
        let uni = &protocols[&Protocol::Uniswap];
        assert_eq!(uni.api_key, "secret");
        assert_eq!(uni.page_size, 500);
        assert_eq!(protocols[&Protocol::Sushiswap].page_size, 1000);
    }

    #[test]
    fn test_missing_env_var_names_location() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_protocols(dir.path());

        let err = load_protocol_config_from(&path, |_| None).unwrap_err();
        match err {
            DataplaneError::MissingEnvVar { variable, location } => {
                assert_eq!(variable, "GRAPH_API_KEY");
                assert!(location.ends_with(".api_key"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_candidates_order_and_dedup() {
        let start = Path::new("/srv/app/jobs");
        let candidates =
            protocol_config_candidates(Some(PathBuf::from("/app/protocols.yml")), start);

        assert_eq!(candidates[0], PathBuf::from("/app/protocols.yml"));
        assert_eq!(candidates[1], PathBuf::from("/srv/app/jobs/protocols.yml"));
        assert_eq!(candidates.last().unwrap(), &PathBuf::from("/protocols.yml"));
        assert_eq!(
            candidates
                .iter()
                .filter(|p| p.as_path() == Path::new("/app/protocols.yml"))
                .count(),
            1
        );
    }

    #[test]
    fn test_locate_first_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_protocols(dir.path());
        let candidates = vec![dir.path().join("missing.yml"), path.clone()];
        assert_eq!(locate_protocol_config_in(&candidates).unwrap(), path);

        let err = locate_protocol_config_in(&candidates[..1]).unwrap_err();
        assert!(err.to_string().contains("missing.yml"));
    }
}
