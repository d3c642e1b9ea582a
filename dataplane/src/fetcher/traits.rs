//! Traits and common types for hourly fetchers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{types::PoolHourData, Result};

/// A source of hourly pool snapshots
#[async_trait]
pub trait HourlyFetcher: Send + Sync {
    /// Name used in logs and output paths
    fn name(&self) -> &str;

    /// Fetch every record in `[interval_end - 1h, interval_end]`
    async fn fetch_interval(&self, interval_end: DateTime<Utc>) -> Result<Vec<PoolHourData>>;

    /// Write records as `{"raw": record}` JSONL
    fn save(&self, records: &[PoolHourData], output: &Path) -> Result<()>;

    /// Fetch then save
    async fn run(&self, output: &Path, interval_end: DateTime<Utc>) -> Result<FetchReport> {
        let started = std::time::Instant::now();
        let records = self.fetch_interval(interval_end).await?;
        self.save(&records, output)?;
        Ok(FetchReport {
            fetcher: self.name().to_string(),
            interval_end,
            records: records.len(),
            output: output.display().to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

/// Outcome of one fetch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchReport {
    pub fetcher: String,
    pub interval_end: DateTime<Utc>,
    pub records: usize,
    pub output: String,
    pub elapsed_ms: u64,
}
