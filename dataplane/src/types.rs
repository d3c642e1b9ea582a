//! Core data types and schemas for the dataplane

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Protocol;

/// Model features, in the exact order the anomaly model consumes them
pub const FEATURE_NAMES: [&str; 13] = [
    "volume_usd",
    "tvl_usd",
    "liquidity",
    "tx_count",
    "vol_rate_24h",
    "tvl_rate_24h",
    "vol_ma_6h",
    "vol_ma_24h",
    "vol_std_24h",
    "vol_tvl_ratio",
    "volume_zscore",
    "hour_of_day",
    "day_of_week",
];

/// Entity type under which pool features are served
pub const ENTITY_TYPE_ID: &str = "dex_liquidity";

/// Token information as returned by the subgraph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub decimals: String,
}

/// Pool information nested inside every hourly record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub id: String,
    pub token0: TokenInfo,
    pub token1: TokenInfo,
    /// Only present on V3-style pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_tier: Option<String>,
}

/// Hourly pool snapshot (`poolHourDatas` entity). Decimal values are
/// carried as strings to avoid precision loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolHourData {
    pub id: String,
    pub period_start_unix: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolInfo>,
    pub liquidity: String,
    pub sqrt_price: String,
    pub token0_price: String,
    pub token1_price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick: Option<String>,
    #[serde(default, rename = "feeGrowthGlobal0X128", skip_serializing_if = "Option::is_none")]
    pub fee_growth_global0_x128: Option<String>,
    #[serde(default, rename = "feeGrowthGlobal1X128", skip_serializing_if = "Option::is_none")]
    pub fee_growth_global1_x128: Option<String>,
    #[serde(rename = "tvlUSD")]
    pub tvl_usd: String,
    pub volume_token0: String,
    pub volume_token1: String,
    #[serde(rename = "volumeUSD")]
    pub volume_usd: String,
    #[serde(rename = "feesUSD")]
    pub fees_usd: String,
    pub tx_count: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
}

/// One JSONL line as written by the fetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub raw: PoolHourData,
}

/// Distinct pool metadata flattened out of the nested `pool` object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolMetadata {
    pub pool_id: String,
    pub fee_tier: Option<String>,
    pub token0_id: String,
    pub token0_symbol: String,
    pub token0_name: String,
    pub token0_decimals: String,
    pub token1_id: String,
    pub token1_symbol: String,
    pub token1_name: String,
    pub token1_decimals: String,
}

impl PoolMetadata {
    /// Flatten a nested pool object
    pub fn from_pool(pool: &PoolInfo) -> Self {
        Self {
            pool_id: pool.id.clone(),
            fee_tier: pool.fee_tier.clone(),
            token0_id: pool.token0.id.clone(),
            token0_symbol: pool.token0.symbol.clone(),
            token0_name: pool.token0.name.clone(),
            token0_decimals: pool.token0.decimals.clone(),
            token1_id: pool.token1.id.clone(),
            token1_symbol: pool.token1.symbol.clone(),
            token1_name: pool.token1.name.clone(),
            token1_decimals: pool.token1.decimals.clone(),
        }
    }
}

/// Typed, flattened hourly row (`raw_clean_with_pool`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanPoolHour {
    pub protocol: Protocol,
    pub id: String,
    pub pool_id: String,
    pub hour_ts: DateTime<Utc>,
    pub volume_usd: f64,
    pub tvl_usd: f64,
    pub liquidity: f64,
    pub volume_token0: f64,
    pub volume_token1: f64,
    pub fees_usd: f64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub tx_count: i64,
    pub tick: Option<f64>,
    pub sqrt_price: f64,
    pub token0_price: f64,
    pub token1_price: f64,
    #[serde(default)]
    pub pool: Option<PoolMetadata>,
}

/// Engineered features for one pool at one hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolFeatureRow {
    pub dex: Protocol,
    pub pool_id: String,
    pub hour_ts: DateTime<Utc>,
    pub features: BTreeMap<String, f64>,
}

impl PoolFeatureRow {
    /// Feature values in `FEATURE_NAMES` order; absent names take `default`
    pub fn vector(&self, default: f64) -> Vec<f64> {
        FEATURE_NAMES
            .iter()
            .map(|name| self.features.get(*name).copied().unwrap_or(default))
            .collect()
    }

    /// Row in the feature-store import shape
    pub fn to_import_record(&self) -> serde_json::Value {
        let mut record = serde_json::Map::new();
        record.insert("entity_id".to_string(), self.pool_id.clone().into());
        record.insert(
            "feature_timestamp".to_string(),
            self.hour_ts.to_rfc3339().into(),
        );
        for name in FEATURE_NAMES {
            let value = self.features.get(name).copied().unwrap_or(0.0);
            record.insert(name.to_string(), value.into());
        }
        serde_json::Value::Object(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record() -> serde_json::Value {
        serde_json::json!({
            "id": "0xpool-480000",
            "periodStartUnix": 1_728_000_000,
            "pool": {
                "id": "0xpool",
                "feeTier": "3000",
                "token0": {"id": "0xa", "symbol": "WETH", "name": "Wrapped Ether", "decimals": "18"},
                "token1": {"id": "0xb", "symbol": "USDC", "name": "USD Coin", "decimals": "6"}
            },
            "liquidity": "123456789",
            "sqrtPrice": "1461446703485210103287273052203988822378723970341",
            "token0Price": "0.0004",
            "token1Price": "2500.5",
            "tick": "-200000",
            "feeGrowthGlobal0X128": "1",
            "feeGrowthGlobal1X128": "2",
            "tvlUSD": "1000000.5",
            "volumeToken0": "10",
            "volumeToken1": "25000",
            "volumeUSD": "25000.25",
            "feesUSD": "75",
            "txCount": "42",
            "open": "2490",
            "high": "2510",
            "low": "2480",
            "close": "2500"
        })
    }

    #[test]
    fn test_pool_hour_data_wire_names() {
        let record: PoolHourData = serde_json::from_value(sample_record()).unwrap();
        assert_eq!(record.tvl_usd, "1000000.5");
        assert_eq!(record.volume_usd, "25000.25");
        assert_eq!(record.fee_growth_global0_x128.as_deref(), Some("1"));
        assert_eq!(record.pool.as_ref().unwrap().fee_tier.as_deref(), Some("3000"));

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["tvlUSD"], "1000000.5");
        assert_eq!(back["feeGrowthGlobal1X128"], "2");
    }

    #[test]
    fn test_feature_vector_order_and_default() {
        let mut features = BTreeMap::new();
        features.insert("day_of_week".to_string(), 6.0);
        features.insert("volume_usd".to_string(), 10.0);
        let row = PoolFeatureRow {
            dex: Protocol::Uniswap,
            pool_id: "0xpool".to_string(),
            hour_ts: Utc.with_ymd_and_hms(2024, 10, 4, 12, 0, 0).unwrap(),
            features,
        };

        let vector = row.vector(-1.0);
        assert_eq!(vector.len(), FEATURE_NAMES.len());
        assert_eq!(vector[0], 10.0);
        assert_eq!(vector[1], -1.0);
        assert_eq!(vector[12], 6.0);
    }

    #[test]
    fn test_import_record_shape() {
        let row = PoolFeatureRow {
            dex: Protocol::Sushiswap,
            pool_id: "0xpool".to_string(),
            hour_ts: Utc.with_ymd_and_hms(2024, 10, 4, 12, 0, 0).unwrap(),
            features: BTreeMap::new(),
        };
        let record = row.to_import_record();
        assert_eq!(record["entity_id"], "0xpool");
        assert_eq!(record["feature_timestamp"], "2024-10-04T12:00:00+00:00");
        assert_eq!(record["vol_tvl_ratio"], 0.0);
    }
}
