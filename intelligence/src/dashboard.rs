//! Point-in-time inspection of the feature table

use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use poolsentry_dataplane::utils::read_jsonl;
use poolsentry_dataplane::{PoolFeatureRow, Protocol};

use crate::error::Result;
use crate::model::IsolationForest;

/// Features shown next to a verdict
pub const DISPLAY_FEATURES: [&str; 8] = [
    "tvl_usd",
    "volume_usd",
    "liquidity",
    "vol_rate_24h",
    "tvl_rate_24h",
    "vol_ma_6h",
    "vol_ma_24h",
    "vol_tvl_ratio",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Normal,
    Anomaly,
}

impl Status {
    /// `1` is normal, `-1` is an anomaly
    pub fn from_label(label: i8) -> Self {
        if label == -1 {
            Status::Anomaly
        } else {
            Status::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Normal => "normal",
            Status::Anomaly => "anomaly",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub dex: Protocol,
    pub pool_id: String,
    pub hour_ts: DateTime<Utc>,
    pub anomaly_score: f64,
    pub label: i8,
    pub status: Status,
    pub features: Vec<(&'static str, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InspectOutcome {
    NoData { at: DateTime<Utc> },
    Verdict(Verdict),
}

impl InspectOutcome {
    /// Plain-text table for the terminal
    pub fn render(&self) -> String {
        let verdict = match self {
            InspectOutcome::NoData { at } => {
                return format!("No feature data at or before {}\n", at.to_rfc3339());
            }
            InspectOutcome::Verdict(verdict) => verdict,
        };

        let mut out = String::new();
        let _ = writeln!(out, "{:<16} {}", "pool_id", verdict.pool_id);
        let _ = writeln!(out, "{:<16} {}", "dex", verdict.dex);
        let _ = writeln!(out, "{:<16} {}", "hour_ts", verdict.hour_ts.to_rfc3339());
        for (name, value) in &verdict.features {
            let _ = writeln!(out, "{:<16} {:.6}", name, value);
        }
        let _ = writeln!(out, "{:<16} {:.4}", "anomaly_score", verdict.anomaly_score);
        let _ = writeln!(out, "{:<16} {} ({})", "status", verdict.status.as_str(), verdict.label);
        out
    }
}

/// Latest row at or before `at` across all pools
pub fn latest_row_at(rows: &[PoolFeatureRow], at: DateTime<Utc>) -> Option<&PoolFeatureRow> {
    rows.iter().filter(|r| r.hour_ts <= at).max_by_key(|r| r.hour_ts)
}

/// Score the latest feature row at or before `at`
pub fn inspect(features_path: &Path, at: DateTime<Utc>, model: &IsolationForest) -> Result<InspectOutcome> {
    let (rows, _): (Vec<PoolFeatureRow>, usize) = read_jsonl(features_path)?;
    let Some(row) = latest_row_at(&rows, at) else {
        info!(at = %at, "No feature row found");
        return Ok(InspectOutcome::NoData { at });
    };

    let vector = row.vector(0.0);
    let anomaly_score = -model.score_row(&vector)?;
    let label = model.predict(&[vector])?.first().copied().unwrap_or(1);

    Ok(InspectOutcome::Verdict(Verdict {
        dex: row.dex,
        pool_id: row.pool_id.clone(),
        hour_ts: row.hour_ts,
        anomaly_score,
        label,
        status: Status::from_label(label),
        features: DISPLAY_FEATURES
            .iter()
            .map(|name| (*name, row.features.get(*name).copied().unwrap_or(0.0)))
            .collect(),
    }))
}
