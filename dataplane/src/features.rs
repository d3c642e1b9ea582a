//! Per-pool hourly feature engineering

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound::{Excluded, Included};
use std::path::Path;
use tracing::{debug, info};

use crate::{
    config::FeatureConfig,
    types::{CleanPoolHour, PoolFeatureRow},
    utils::{rate_of_change, read_jsonl, simple_moving_average, standard_deviation, write_jsonl},
    Protocol, Result,
};

type Series<'a> = BTreeMap<DateTime<Utc>, &'a CleanPoolHour>;

/// Computes the model features over each pool's hourly history
#[derive(Debug, Clone)]
pub struct FeatureEngineer {
    short_window: ChronoDuration,
    long_window: ChronoDuration,
    rate_lag: ChronoDuration,
}

impl Default for FeatureEngineer {
    fn default() -> Self {
        Self {
            short_window: ChronoDuration::hours(6),
            long_window: ChronoDuration::hours(24),
            rate_lag: ChronoDuration::hours(24),
        }
    }
}

impl FeatureEngineer {
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            short_window: ChronoDuration::hours(config.short_window_hours),
            long_window: ChronoDuration::hours(config.long_window_hours),
            rate_lag: ChronoDuration::hours(config.rate_lag_hours),
        }
    }

    /// Feature rows for every `(protocol, pool, hour)`, ordered by pool then hour.
    /// Rows sharing a pool and hour keep the last one.
    pub fn engineer(&self, rows: &[CleanPoolHour]) -> Vec<PoolFeatureRow> {
        let mut pools: BTreeMap<(Protocol, &str), Series<'_>> = BTreeMap::new();
        for row in rows {
            pools
                .entry((row.protocol, row.pool_id.as_str()))
                .or_default()
                .insert(row.hour_ts, row);
        }

        let mut output = Vec::with_capacity(rows.len());
        for ((protocol, pool_id), series) in &pools {
            debug!(protocol = %protocol, pool_id = %pool_id, hours = series.len(), "Engineering pool");
            for (&hour_ts, row) in series {
                output.push(PoolFeatureRow {
                    dex: *protocol,
                    pool_id: pool_id.to_string(),
                    hour_ts,
                    features: self.features_at(series, hour_ts, row),
                });
            }
        }
        output
    }

    fn window_volumes(&self, series: &Series<'_>, at: DateTime<Utc>, width: ChronoDuration) -> Vec<f64> {
        series
            .range((Excluded(at - width), Included(at)))
            .map(|(_, row)| row.volume_usd)
            .collect()
    }

    fn features_at(&self, series: &Series<'_>, at: DateTime<Utc>, row: &CleanPoolHour) -> BTreeMap<String, f64> {
        let lagged = series.get(&(at - self.rate_lag));
        let vol_rate = lagged.map(|prev| rate_of_change(prev.volume_usd, row.volume_usd)).unwrap_or(0.0);
        let tvl_rate = lagged.map(|prev| rate_of_change(prev.tvl_usd, row.tvl_usd)).unwrap_or(0.0);

        let short = self.window_volumes(series, at, self.short_window);
        let long = self.window_volumes(series, at, self.long_window);
        let ma_short = simple_moving_average(&short);
        let ma_long = simple_moving_average(&long);
        let std_long = standard_deviation(&long);

        let ratio = if row.tvl_usd == 0.0 { 0.0 } else { row.volume_usd / row.tvl_usd };
        let zscore = if std_long == 0.0 { 0.0 } else { (row.volume_usd - ma_long) / std_long };

        let values = [
            ("volume_usd", row.volume_usd),
            ("tvl_usd", row.tvl_usd),
            ("liquidity", row.liquidity),
            ("tx_count", row.tx_count as f64),
            ("vol_rate_24h", vol_rate),
            ("tvl_rate_24h", tvl_rate),
            ("vol_ma_6h", ma_short),
            ("vol_ma_24h", ma_long),
            ("vol_std_24h", std_long),
            ("vol_tvl_ratio", ratio),
            ("volume_zscore", zscore),
            ("hour_of_day", at.hour() as f64),
            ("day_of_week", at.weekday().num_days_from_monday() as f64),
        ];
        values.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

/// Read a clean table, engineer features and write them out.
///
/// With `import_format` the output uses the feature-store import shape
/// instead of `PoolFeatureRow`.
pub fn build_feature_table(
    clean_path: &Path,
    output: &Path,
    engineer: &FeatureEngineer,
    import_format: bool,
) -> Result<usize> {
    let (rows, skipped): (Vec<CleanPoolHour>, usize) = read_jsonl(clean_path)?;
    let features = engineer.engineer(&rows);

    if import_format {
        let records: Vec<serde_json::Value> = features.iter().map(PoolFeatureRow::to_import_record).collect();
        write_jsonl(output, &records)?;
    } else {
        write_jsonl(output, &features)?;
    }

    let pools: HashSet<&str> = features.iter().map(|f| f.pool_id.as_str()).collect();
    info!(
        input_rows = rows.len(),
        skipped_lines = skipped,
        feature_rows = features.len(),
        pools = pools.len(),
        import_format = import_format,
        output = %output.display(),
        "Wrote feature table"
    );
    Ok(features.len())
}
