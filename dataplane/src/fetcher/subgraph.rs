//! GraphQL subgraph fetcher for `poolHourDatas`

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::{
    fetcher::traits::HourlyFetcher,
    types::{PoolHourData, RawRecord},
    utils::{retry_with_backoff, write_jsonl, RetryConfig},
    DataplaneError, Result,
};

/// Per-request timeout for subgraph calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    #[serde(default)]
    data: Option<PageData>,
    #[serde(default)]
    errors: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageData {
    #[serde(default)]
    pool_hour_datas: Vec<PoolHourData>,
}

/// Paginating fetcher against one subgraph endpoint
pub struct SubgraphFetcher {
    name: String,
    endpoint: String,
    query: String,
    page_size: u32,
    headers: HeaderMap,
    client: reqwest::Client,
    retry: RetryConfig,
}

impl SubgraphFetcher {
    /// Create a new fetcher
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        query: impl Into<String>,
        page_size: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            name: name.into(),
            endpoint: endpoint.into(),
            query: query.into(),
            page_size: page_size.max(1),
            headers: HeaderMap::new(),
            client,
            retry: RetryConfig::default(),
        })
    }

    /// Add a header sent with every request
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DataplaneError::fetch(format!("invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DataplaneError::fetch(format!("invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Replace the retry policy used per page
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    async fn fetch_page(&self, start_ts: i64, end_ts: i64, skip: u32) -> Result<Vec<PoolHourData>> {
        let body = serde_json::json!({
            "query": self.query,
            "variables": {
                "startTime": start_ts,
                "endTime": end_ts,
                "first": self.page_size,
                "skip": skip,
            }
        });

        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DataplaneError::HttpStatus {
                status: status.as_u16(),
                endpoint: self.endpoint.clone(),
            });
        }

        let parsed: GraphQlResponse = response.json().await?;
        if let Some(errors) = parsed.errors.filter(|errors| !errors.is_empty()) {
            return Err(DataplaneError::GraphQl {
                endpoint: self.endpoint.clone(),
                errors: serde_json::to_string(&errors)?,
            });
        }

        let data = parsed
            .data
            .ok_or_else(|| DataplaneError::fetch("response has neither data nor errors"))?;
        Ok(data.pool_hour_datas)
    }
}

#[async_trait]
impl HourlyFetcher for SubgraphFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_interval(&self, interval_end: DateTime<Utc>) -> Result<Vec<PoolHourData>> {
        let start_ts = (interval_end - ChronoDuration::hours(1)).timestamp();
        let end_ts = interval_end.timestamp();

        let mut records = Vec::new();
        let mut skip = 0u32;
        loop {
            debug!(fetcher = %self.name, skip = skip, "Fetching page");
            let page = retry_with_backoff(
                || self.fetch_page(start_ts, end_ts, skip),
                self.retry.clone(),
                "subgraph_page",
                DataplaneError::is_retryable,
            )
            .await?;

            let page_len = page.len();
            records.extend(page);
            if page_len < self.page_size as usize {
                break;
            }
            skip += self.page_size;
        }

        info!(
            fetcher = %self.name,
            start_ts = start_ts,
            end_ts = end_ts,
            records = records.len(),
            "Fetched interval"
        );
        Ok(records)
    }

    fn save(&self, records: &[PoolHourData], output: &Path) -> Result<()> {
        let lines: Vec<RawRecord> = records
            .iter()
            .cloned()
            .map(|raw| RawRecord { raw })
            .collect();
        write_jsonl(output, &lines)?;
        info!(fetcher = %self.name, count = lines.len(), output = %output.display(), "Saved records");
        Ok(())
    }
}
