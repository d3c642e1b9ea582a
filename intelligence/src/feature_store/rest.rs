//! REST transport for the online serving API

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use super::client::OnlineServingApi;
use super::types::{ReadFeatureValuesRequest, ReadFeatureValuesResponse, StreamingReadFeatureValuesRequest};
use crate::config::FeatureStoreConfig;
use crate::error::{IntelligenceError, Result};

/// Token endpoint of the instance metadata server
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before a cached token expires
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Where bearer tokens come from
pub enum TokenSource {
    Static(String),
    MetadataServer {
        url: String,
        cached: Mutex<Option<(String, Instant)>>,
    },
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

impl TokenSource {
    pub fn metadata_server<S: Into<String>>(url: S) -> Self {
        TokenSource::MetadataServer {
            url: url.into(),
            cached: Mutex::new(None),
        }
    }

    async fn token(&self, client: &Client) -> Result<String> {
        let (url, cached) = match self {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::MetadataServer { url, cached } => (url, cached),
        };

        let still_valid = cached
            .lock()
            .as_ref()
            .filter(|(_, expires_at)| Instant::now() + TOKEN_REFRESH_MARGIN < *expires_at)
            .map(|(token, _)| token.clone());
        if let Some(token) = still_valid {
            return Ok(token);
        }

        let response = client
            .get(url.as_str())
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;
        let fresh: MetadataToken = response.json().await?;

        debug!(expires_in = fresh.expires_in, "Access token refreshed");
        let expires_at = Instant::now() + Duration::from_secs(fresh.expires_in);
        *cached.lock() = Some((fresh.access_token.clone(), expires_at));
        Ok(fresh.access_token)
    }
}

/// Online serving over HTTPS + JSON
pub struct RestOnlineServingClient {
    client: Client,
    endpoint: Url,
    tokens: TokenSource,
}

impl RestOnlineServingClient {
    pub fn new(endpoint: Url, tokens: TokenSource, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            tokens,
        })
    }

    /// Static token when configured, the metadata server otherwise
    pub fn from_config(config: &FeatureStoreConfig, timeout: Duration) -> Result<Self> {
        let tokens = match &config.access_token {
            Some(token) => TokenSource::Static(token.clone()),
            None => TokenSource::metadata_server(METADATA_TOKEN_URL),
        };
        Self::new(config.endpoint()?, tokens, timeout)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn method_url(&self, entity_type: &str, method: &str) -> String {
        format!(
            "{}/v1/{}:{}",
            self.endpoint.as_str().trim_end_matches('/'),
            entity_type,
            method
        )
    }

    async fn post<B: serde::Serialize + Sync>(&self, url: String, body: &B) -> Result<Response> {
        let token = self.tokens.token(&self.client).await?;
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response).await
    }
}

#[async_trait]
impl OnlineServingApi for RestOnlineServingClient {
    async fn read_feature_values(&self, request: &ReadFeatureValuesRequest) -> Result<ReadFeatureValuesResponse> {
        let url = self.method_url(&request.entity_type, "readFeatureValues");
        let response = self.post(url, request).await?;
        Ok(response.json().await?)
    }

    async fn streaming_read_feature_values(
        &self,
        request: &StreamingReadFeatureValuesRequest,
    ) -> Result<Vec<ReadFeatureValuesResponse>> {
        let url = self.method_url(&request.entity_type, "streamingReadFeatureValues");
        let response = self.post(url, request).await?;
        Ok(response.json().await?)
    }
}

fn map_transport_error(error: reqwest::Error) -> IntelligenceError {
    if error.is_timeout() {
        IntelligenceError::DeadlineExceeded(error.to_string())
    } else if error.is_connect() {
        IntelligenceError::ServiceUnavailable(error.to_string())
    } else {
        IntelligenceError::Http(error)
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
            IntelligenceError::DeadlineExceeded(format!("{}: {}", status, body))
        }
        StatusCode::SERVICE_UNAVAILABLE => IntelligenceError::ServiceUnavailable(format!("{}: {}", status, body)),
        _ => IntelligenceError::FeatureServing {
            status: status.as_u16(),
            message: body,
        },
    })
}
