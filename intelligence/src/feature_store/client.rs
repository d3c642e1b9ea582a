//! Online feature reads with retry, default backfill and batch fallback

use async_trait::async_trait;
use futures::future::try_join_all;
use metrics::increment_counter;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use poolsentry_dataplane::utils::{mask_entity_id, retry_with_backoff, RetryConfig};

use super::decode::{backfill, decode_entity_view, decode_features, FeatureMap};
use super::rest::RestOnlineServingClient;
use super::types::{
    FeatureSelector, ReadFeatureValuesRequest, ReadFeatureValuesResponse, ResponseHeader,
    StreamingReadFeatureValuesRequest,
};
use crate::config::{FeatureStoreConfig, IntelligenceConfig};
use crate::error::{IntelligenceError, Result};
use crate::telemetry::{FEATURE_STORE_FALLBACKS_TOTAL, FEATURE_STORE_READS_TOTAL};

/// Remote online-serving surface
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OnlineServingApi: Send + Sync {
    /// Read the latest values of selected features for one entity
    async fn read_feature_values(&self, request: &ReadFeatureValuesRequest) -> Result<ReadFeatureValuesResponse>;

    /// Read several entities at once; the first message may carry only the header
    async fn streaming_read_feature_values(
        &self,
        request: &StreamingReadFeatureValuesRequest,
    ) -> Result<Vec<ReadFeatureValuesResponse>>;
}

/// Feature store client bound to one entity type
pub struct FeatureStoreClient {
    api: Arc<dyn OnlineServingApi>,
    entity_type: String,
    retry: RetryConfig,
}

impl FeatureStoreClient {
    /// Create a client over any serving implementation
    pub fn new<S: Into<String>>(api: Arc<dyn OnlineServingApi>, entity_type: S) -> Self {
        Self {
            api,
            entity_type: entity_type.into(),
            retry: IntelligenceConfig::default().serving_retry(),
        }
    }

    /// Replace the retry policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Client over the REST surface described by `store`
    pub fn from_config(store: &FeatureStoreConfig, config: &IntelligenceConfig) -> Result<Self> {
        let api = RestOnlineServingClient::from_config(
            store,
            Duration::from_millis(config.serving.request_timeout_ms),
        )?;
        info!(
            entity_type = %store.entity_type_path(),
            endpoint = %api.endpoint(),
            "Feature store client initialized"
        );
        Ok(Self::new(Arc::new(api), store.entity_type_path()).with_retry(config.serving_retry()))
    }

    /// Full entity type resource name
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// Read features for one entity.
    ///
    /// With a default, missing features are backfilled and a failed read
    /// yields the default for every requested id. Without one, missing
    /// features stay absent and a failed read is returned as an error.
    pub async fn read_features<S: AsRef<str>>(
        &self,
        entity_id: &str,
        feature_ids: &[S],
        default: Option<f64>,
    ) -> Result<FeatureMap> {
        let request = ReadFeatureValuesRequest {
            entity_type: self.entity_type.clone(),
            entity_id: entity_id.to_string(),
            feature_selector: FeatureSelector::ids(feature_ids),
        };

        let outcome = retry_with_backoff(
            || self.api.read_feature_values(&request),
            self.retry.clone(),
            "read_feature_values",
            IntelligenceError::is_retryable,
        )
        .await;

        match outcome {
            Ok(response) => {
                increment_counter!(FEATURE_STORE_READS_TOTAL, "mode" => "single", "outcome" => "ok");
                let decoded = decode_features(&response);
                debug!(
                    entity = %mask_entity_id(entity_id),
                    decoded = decoded.len(),
                    requested = feature_ids.len(),
                    "Features read"
                );
                Ok(complete_read(entity_id, decoded, feature_ids, default))
            }
            Err(e) => {
                increment_counter!(FEATURE_STORE_READS_TOTAL, "mode" => "single", "outcome" => "error");
                match default {
                    Some(value) => {
                        warn!(
                            entity = %mask_entity_id(entity_id),
                            error = %e,
                            default = value,
                            "Feature read failed, using defaults"
                        );
                        Ok(backfill(FeatureMap::new(), feature_ids, default))
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Read features for several entities with one streaming call.
    ///
    /// Repeated ids are requested once. Responses are matched by entity id.
    /// Entities the response omits are backfilled like an empty read. If the
    /// batch call fails, every entity is read on its own.
    pub async fn read_features_batch<S: AsRef<str> + Sync>(
        &self,
        entity_ids: &[String],
        feature_ids: &[S],
        default: Option<f64>,
    ) -> Result<HashMap<String, FeatureMap>> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut seen = HashSet::new();
        let unique_ids: Vec<String> = entity_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();

        let request = StreamingReadFeatureValuesRequest {
            entity_type: self.entity_type.clone(),
            entity_ids: unique_ids.clone(),
            feature_selector: FeatureSelector::ids(feature_ids),
        };

        let outcome = retry_with_backoff(
            || self.api.streaming_read_feature_values(&request),
            self.retry.clone(),
            "streaming_read_feature_values",
            IntelligenceError::is_retryable,
        )
        .await;

        match outcome {
            Ok(responses) => {
                increment_counter!(FEATURE_STORE_READS_TOTAL, "mode" => "batch", "outcome" => "ok");
                let mut decoded = decode_stream(&responses);
                let result = unique_ids
                    .into_iter()
                    .map(|id| {
                        let features = complete_read(&id, decoded.remove(&id).unwrap_or_default(), feature_ids, default);
                        (id, features)
                    })
                    .collect();
                Ok(result)
            }
            Err(e) => {
                increment_counter!(FEATURE_STORE_READS_TOTAL, "mode" => "batch", "outcome" => "error");
                increment_counter!(FEATURE_STORE_FALLBACKS_TOTAL);
                warn!(
                    entities = unique_ids.len(),
                    error = %e,
                    "Batch read failed, falling back to per-entity reads"
                );
                let reads = unique_ids.iter().map(|id| async move {
                    let features = self.read_features(id, feature_ids, default).await?;
                    Ok::<_, IntelligenceError>((id.clone(), features))
                });
                Ok(try_join_all(reads).await?.into_iter().collect())
            }
        }
    }
}

/// Backfill a decoded read; warns only when nothing is left after backfill
fn complete_read<S: AsRef<str>>(
    entity_id: &str,
    decoded: FeatureMap,
    feature_ids: &[S],
    default: Option<f64>,
) -> FeatureMap {
    let features = backfill(decoded, feature_ids, default);
    if features.is_empty() {
        warn!("No features returned for pool_id={}", mask_entity_id(entity_id));
    }
    features
}

/// Decode streamed messages into per-entity maps. A message without
/// descriptors is decoded against the last header seen.
fn decode_stream(responses: &[ReadFeatureValuesResponse]) -> HashMap<String, FeatureMap> {
    let mut header = ResponseHeader::default();
    let mut decoded = HashMap::new();

    for response in responses {
        if !response.header.feature_descriptors.is_empty() {
            header = response.header.clone();
        }
        let view = &response.entity_view;
        if view.entity_id.is_empty() {
            continue;
        }
        decoded.insert(view.entity_id.clone(), decode_entity_view(&header, view));
    }
    decoded
}

/// Layered config for the shared client; defaults when loading fails
fn shared_client_config() -> IntelligenceConfig {
    IntelligenceConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Falling back to default intelligence config");
        IntelligenceConfig::default()
    })
}

static SHARED_CLIENT: OnceCell<Arc<FeatureStoreClient>> = OnceCell::new();

/// Process-wide client built from the environment on first use
pub fn shared_client() -> Result<Arc<FeatureStoreClient>> {
    SHARED_CLIENT
        .get_or_try_init(|| {
            let store = FeatureStoreConfig::from_env()?;
            let config = shared_client_config();
            FeatureStoreClient::from_config(&store, &config).map(Arc::new)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_store::types::FeatureValue;

    const ENTITY_TYPE: &str = "projects/p/locations/r/featurestores/f/entityTypes/dex_liquidity";

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            deadline: Some(Duration::from_secs(5)),
        }
    }

    fn client(api: MockOnlineServingApi) -> FeatureStoreClient {
        FeatureStoreClient::new(Arc::new(api), ENTITY_TYPE).with_retry(fast_retry())
    }

    fn single(entity_id: &str) -> ReadFeatureValuesResponse {
        ReadFeatureValuesResponse::from_values(
            entity_id,
            vec![
                ("volume_usd", Some(FeatureValue::Double(1_000_000.0))),
                ("tx_count", Some(FeatureValue::Int64(150))),
            ],
        )
    }

    #[tokio::test]
    async fn test_read_features_decodes_and_backfills() {
        let mut api = MockOnlineServingApi::new();
        api.expect_read_feature_values()
            .withf(|req| {
                req.entity_id == "0xpool"
                    && req.entity_type == ENTITY_TYPE
                    && req.feature_selector.id_matcher.ids == vec!["volume_usd", "tx_count", "tvl_usd"]
            })
            .times(1)
            .returning(|_| Ok(single("0xpool")));

        let features = client(api)
            .read_features("0xpool", &["volume_usd", "tx_count", "tvl_usd"], Some(0.0))
            .await
            .unwrap();

        assert_eq!(features["volume_usd"], 1_000_000.0);
        assert_eq!(features["tx_count"], 150.0);
        assert_eq!(features["tvl_usd"], 0.0);
    }

    #[tokio::test]
    async fn test_read_features_without_default_leaves_gaps() {
        let mut api = MockOnlineServingApi::new();
        api.expect_read_feature_values()
            .returning(|_| Ok(single("0xpool")));

        let features = client(api)
            .read_features("0xpool", &["volume_usd", "tvl_usd"], None)
            .await
            .unwrap();
        assert!(!features.contains_key("tvl_usd"));
    }

    #[tokio::test]
    async fn test_failed_read_returns_defaults() {
        let mut api = MockOnlineServingApi::new();
        api.expect_read_feature_values()
            .times(1)
            .returning(|_| {
                Err(IntelligenceError::FeatureServing {
                    status: 500,
                    message: "boom".into(),
                })
            });

        let features = client(api)
            .read_features("0xpool", &["volume_usd", "tvl_usd"], Some(-1.0))
            .await
            .unwrap();
        assert_eq!(features.len(), 2);
        assert!(features.values().all(|v| *v == -1.0));
    }

    #[tokio::test]
    async fn test_failed_read_without_default_errors() {
        let mut api = MockOnlineServingApi::new();
        api.expect_read_feature_values()
            .returning(|_| Err(IntelligenceError::internal("boom")));

        let result = client(api).read_features("0xpool", &["volume_usd"], None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut api = MockOnlineServingApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_read_feature_values()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(IntelligenceError::ServiceUnavailable("503".into())));
        api.expect_read_feature_values()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(IntelligenceError::DeadlineExceeded("504".into())));
        api.expect_read_feature_values()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(single("0xpool")));

        let features = client(api)
            .read_features("0xpool", &["volume_usd"], None)
            .await
            .unwrap();
        assert_eq!(features["volume_usd"], 1_000_000.0);
    }

    #[tokio::test]
    async fn test_batch_matches_by_entity_id() {
        let mut api = MockOnlineServingApi::new();
        api.expect_streaming_read_feature_values()
            .times(1)
            .returning(|_| {
                let header = single("").header;
                let mut b = single("0xb");
                b.header = ResponseHeader::default();
                let mut a = single("0xa");
                a.header = ResponseHeader::default();
                a.entity_view.data[0] = crate::feature_store::types::EntityViewData::single(FeatureValue::Double(7.0));
                Ok(vec![
                    ReadFeatureValuesResponse {
                        header,
                        entity_view: Default::default(),
                    },
                    b,
                    a,
                ])
            });

        let ids = vec!["0xa".to_string(), "0xb".to_string(), "0xc".to_string()];
        let result = client(api)
            .read_features_batch(&ids, &["volume_usd", "tx_count"], Some(0.0))
            .await
            .unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result["0xa"]["volume_usd"], 7.0);
        assert_eq!(result["0xb"]["volume_usd"], 1_000_000.0);
        assert_eq!(result["0xc"]["volume_usd"], 0.0);
    }

    #[tokio::test]
    async fn test_batch_falls_back_to_single_reads() {
        let mut api = MockOnlineServingApi::new();
        api.expect_streaming_read_feature_values()
            .times(1)
            .returning(|_| Err(IntelligenceError::internal("stream broke")));
        api.expect_read_feature_values()
            .times(2)
            .returning(|req| Ok(single(&req.entity_id)));

        let ids = vec!["0xa".to_string(), "0xb".to_string()];
        let result = client(api)
            .read_features_batch(&ids, &["volume_usd"], None)
            .await
            .unwrap();
        assert_eq!(result["0xa"]["volume_usd"], 1_000_000.0);
        assert_eq!(result["0xb"]["volume_usd"], 1_000_000.0);
    }

    #[tokio::test]
    async fn test_batch_repeated_ids_keep_features() {
        let mut api = MockOnlineServingApi::new();
        api.expect_streaming_read_feature_values()
            .withf(|req| req.entity_ids == vec!["0xa".to_string(), "0xb".to_string()])
            .times(1)
            .returning(|_| {
                let mut a = single("0xa");
                a.entity_view.data[0] = crate::feature_store::types::EntityViewData::single(FeatureValue::Double(7.0));
                Ok(vec![a, single("0xb")])
            });

        let ids = vec!["0xa".to_string(), "0xb".to_string(), "0xa".to_string()];
        let result = client(api)
            .read_features_batch(&ids, &["volume_usd"], Some(0.0))
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result["0xa"]["volume_usd"], 7.0);
        assert_eq!(result["0xb"]["volume_usd"], 1_000_000.0);
    }

    #[tokio::test]
    async fn test_batch_fallback_reads_repeated_id_once() {
        let mut api = MockOnlineServingApi::new();
        api.expect_streaming_read_feature_values()
            .times(1)
            .returning(|_| Err(IntelligenceError::internal("stream broke")));
        api.expect_read_feature_values()
            .withf(|req| req.entity_id == "0xa")
            .times(1)
            .returning(|req| Ok(single(&req.entity_id)));

        let ids = vec!["0xa".to_string(), "0xa".to_string()];
        let result = client(api)
            .read_features_batch(&ids, &["volume_usd"], None)
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result["0xa"]["volume_usd"], 1_000_000.0);
    }

    #[test]
    fn test_complete_read_backfills_before_empty_check() {
        let filled = complete_read("0xpool", FeatureMap::new(), &["volume_usd", "tvl_usd"], Some(0.0));
        assert_eq!(filled.len(), 2);

        let empty = complete_read("0xpool", FeatureMap::new(), &["volume_usd"], None);
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_empty_response_with_default() {
        let mut api = MockOnlineServingApi::new();
        api.expect_read_feature_values()
            .returning(|req| Ok(ReadFeatureValuesResponse::from_values(&req.entity_id, vec![("volume_usd", None)])));

        let features = client(api)
            .read_features("0xpool", &["volume_usd", "tvl_usd"], Some(1.5))
            .await
            .unwrap();
        assert_eq!(features["volume_usd"], 1.5);
        assert_eq!(features["tvl_usd"], 1.5);
    }

    #[test]
    fn test_shared_client_config_reads_serving_overrides() {
        std::env::set_var("INTELLIGENCE__SERVING__DEADLINE_MS", "2500");
        let config = shared_client_config();
        std::env::remove_var("INTELLIGENCE__SERVING__DEADLINE_MS");

        assert_eq!(config.serving.deadline_ms, 2500);
        assert_eq!(config.serving_retry().deadline, Some(Duration::from_millis(2500)));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let api = MockOnlineServingApi::new();
        let result = client(api)
            .read_features_batch(&[], &["volume_usd"], None)
            .await
            .unwrap();
        assert!(result.is_empty());
    }
}
