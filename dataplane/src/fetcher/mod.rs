//! Hourly pool fetchers
//!
//! Pulls `poolHourDatas` from The Graph subgraphs of each supported DEX and
//! writes them as raw JSONL.

pub mod subgraph;
pub mod traits;

// Re-export commonly used types
pub use subgraph::SubgraphFetcher;
pub use traits::{FetchReport, HourlyFetcher};

use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::info;

use crate::{config::ProtocolConfig, utils::truncate_to_hour, DataplaneConfig, Protocol, Result};

/// Bundled Uniswap V3 query
pub const UNISWAP_QUERY: &str = include_str!("../../queries/uniswap_poolHourDatas.gql");

/// Bundled SushiSwap V3 query
pub const SUSHISWAP_QUERY: &str = include_str!("../../queries/sushiswap_poolHourDatas.gql");

/// Build the Uniswap fetcher
pub fn build_uniswap_fetcher(cfg: &ProtocolConfig) -> Result<SubgraphFetcher> {
    SubgraphFetcher::new(
        Protocol::Uniswap.name(),
        cfg.endpoint(),
        UNISWAP_QUERY,
        cfg.page_size,
    )
}

/// Build the SushiSwap fetcher. The SushiSwap gateway also expects the key
/// as a bearer token.
pub fn build_sushiswap_fetcher(cfg: &ProtocolConfig) -> Result<SubgraphFetcher> {
    SubgraphFetcher::new(
        Protocol::Sushiswap.name(),
        cfg.endpoint(),
        SUSHISWAP_QUERY,
        cfg.page_size,
    )?
    .with_header("Authorization", &format!("Bearer {}", cfg.api_key))
}

/// Build the fetcher for a protocol
pub fn create_fetcher(protocol: Protocol, cfg: &ProtocolConfig) -> Result<SubgraphFetcher> {
    match protocol {
        Protocol::Uniswap => build_uniswap_fetcher(cfg),
        Protocol::Sushiswap => build_sushiswap_fetcher(cfg),
    }
}

/// Current time truncated to the hour
pub fn default_interval_end() -> DateTime<Utc> {
    truncate_to_hour(Utc::now())
}

/// Single entry point: fetch one hour for `protocol` and write it to `output`
pub async fn fetch_pool_data(
    config: &DataplaneConfig,
    protocol: Protocol,
    output: &Path,
    interval_end: DateTime<Utc>,
) -> Result<FetchReport> {
    info!(
        protocol = %protocol,
        interval_end = %interval_end,
        output = %output.display(),
        "START fetch_pool_data"
    );

    let cfg = config.protocol_config(protocol)?;
    cfg.validate(protocol)?;
    let fetcher = create_fetcher(protocol, &cfg)?.with_retry(config.retry_config());
    let report = fetcher.run(output, interval_end).await?;

    info!(protocol = %protocol, records = report.records, "END fetch_pool_data");
    Ok(report)
}
