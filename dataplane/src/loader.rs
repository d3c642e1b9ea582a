//! Raw JSONL → clean table ETL
//!
//! Unions every `{data_dir}/{protocol}/*_pool.jsonl`, casts the string
//! decimals, drops duplicate hourly records and joins the flattened pool
//! metadata back onto each row.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{
    types::{CleanPoolHour, PoolHourData, PoolMetadata, RawRecord},
    utils::{parse_decimal, read_jsonl, timestamp_to_datetime, write_jsonl},
    DataplaneError, Protocol, Result,
};

const RAW_FILE_SUFFIX: &str = "_pool.jsonl";

/// A raw line, either in the fetcher's envelope or bare
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLine {
    Envelope(RawRecord),
    Bare(PoolHourData),
}

impl RawLine {
    fn into_record(self) -> PoolHourData {
        match self {
            RawLine::Envelope(envelope) => envelope.raw,
            RawLine::Bare(record) => record,
        }
    }
}

/// A raw record tagged with the protocol directory it was read from
#[derive(Debug, Clone)]
pub struct TaggedRecord {
    pub protocol: Protocol,
    pub record: PoolHourData,
}

/// Union of all raw files
#[derive(Debug, Default)]
pub struct RawLoad {
    pub records: Vec<TaggedRecord>,
    pub files: Vec<PathBuf>,
    pub skipped_lines: usize,
}

/// Output of the full ETL
#[derive(Debug, Clone)]
pub struct CleanTable {
    pub rows: Vec<CleanPoolHour>,
    pub metadata: BTreeMap<String, PoolMetadata>,
    pub skipped_lines: usize,
    pub duplicates_removed: usize,
}

impl CleanTable {
    /// Persist the joined rows as JSONL
    pub fn write_jsonl(&self, path: &Path) -> Result<()> {
        write_jsonl(path, &self.rows)?;
        info!(path = %path.display(), rows = self.rows.len(), "Wrote clean table");
        Ok(())
    }
}

/// Raw files for one protocol, sorted by file name
pub fn raw_files(data_dir: &Path, protocol: Protocol) -> Result<Vec<PathBuf>> {
    let dir = data_dir.join(protocol.name());
    if !dir.is_dir() {
        warn!(protocol = %protocol, dir = %dir.display(), "Raw directory missing");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.ends_with(RAW_FILE_SUFFIX))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Read and union the raw files of every protocol
pub fn load_raw(data_dir: &Path, protocols: &[Protocol]) -> Result<RawLoad> {
    let mut load = RawLoad::default();

    for &protocol in protocols {
        for file in raw_files(data_dir, protocol)? {
            let (lines, skipped): (Vec<RawLine>, usize) = read_jsonl(&file)?;
            debug!(file = %file.display(), records = lines.len(), skipped = skipped, "Read raw file");
            load.skipped_lines += skipped;
            load.records.extend(lines.into_iter().map(|line| TaggedRecord {
                protocol,
                record: line.into_record(),
            }));
            load.files.push(file);
        }
    }

    info!(
        files = load.files.len(),
        records = load.records.len(),
        skipped_lines = load.skipped_lines,
        "Loaded raw records"
    );
    Ok(load)
}

/// Pool id of an hourly record: the nested pool when present, otherwise the
/// `{pool}-{hourIndex}` prefix of the record id
pub fn pool_id_of(record: &PoolHourData) -> String {
    match &record.pool {
        Some(pool) => pool.id.clone(),
        None => record
            .id
            .rsplit_once('-')
            .map(|(pool, _)| pool.to_string())
            .unwrap_or_else(|| record.id.clone()),
    }
}

/// Distinct pool metadata keyed by pool id
pub fn pool_metadata(records: &[TaggedRecord]) -> BTreeMap<String, PoolMetadata> {
    let mut metadata = BTreeMap::new();
    for tagged in records {
        if let Some(pool) = &tagged.record.pool {
            metadata
                .entry(pool.id.clone())
                .or_insert_with(|| PoolMetadata::from_pool(pool));
        }
    }
    metadata
}

fn parse_tx_count(record_id: &str, value: &str) -> Result<i64> {
    match value.trim().parse::<i64>() {
        Ok(count) => Ok(count),
        Err(_) => parse_decimal("txCount", record_id, value).map(|v| v.trunc() as i64),
    }
}

/// Cast one raw record into a typed row (metadata not yet joined)
pub fn clean_record(protocol: Protocol, record: &PoolHourData) -> Result<CleanPoolHour> {
    let id = record.id.as_str();
    let hour_ts = timestamp_to_datetime(record.period_start_unix).ok_or_else(|| {
        DataplaneError::invalid_value("periodStartUnix", id, record.period_start_unix.to_string())
    })?;
    let tick = record
        .tick
        .as_deref()
        .map(|tick| parse_decimal("tick", id, tick))
        .transpose()?;

    Ok(CleanPoolHour {
        protocol,
        id: record.id.clone(),
        pool_id: pool_id_of(record),
        hour_ts,
        volume_usd: parse_decimal("volumeUSD", id, &record.volume_usd)?,
        tvl_usd: parse_decimal("tvlUSD", id, &record.tvl_usd)?,
        liquidity: parse_decimal("liquidity", id, &record.liquidity)?,
        volume_token0: parse_decimal("volumeToken0", id, &record.volume_token0)?,
        volume_token1: parse_decimal("volumeToken1", id, &record.volume_token1)?,
        fees_usd: parse_decimal("feesUSD", id, &record.fees_usd)?,
        open_price: parse_decimal("open", id, &record.open)?,
        high_price: parse_decimal("high", id, &record.high)?,
        low_price: parse_decimal("low", id, &record.low)?,
        close_price: parse_decimal("close", id, &record.close)?,
        tx_count: parse_tx_count(id, &record.tx_count)?,
        tick,
        sqrt_price: parse_decimal("sqrtPrice", id, &record.sqrt_price)?,
        token0_price: parse_decimal("token0Price", id, &record.token0_price)?,
        token1_price: parse_decimal("token1Price", id, &record.token1_price)?,
        pool: None,
    })
}

/// Cast every record; the first unparsable value aborts
pub fn clean(records: &[TaggedRecord]) -> Result<Vec<CleanPoolHour>> {
    records
        .iter()
        .map(|tagged| clean_record(tagged.protocol, &tagged.record))
        .collect()
}

/// One row per `(protocol, id)`; a later row replaces an earlier one in place.
/// Returns the rows and how many were dropped.
pub fn deduplicate(rows: Vec<CleanPoolHour>) -> (Vec<CleanPoolHour>, usize) {
    let total = rows.len();
    let mut index: HashMap<(Protocol, String), usize> = HashMap::new();
    let mut unique: Vec<CleanPoolHour> = Vec::with_capacity(total);

    for row in rows {
        let key = (row.protocol, row.id.clone());
        match index.get(&key) {
            Some(&position) => unique[position] = row,
            None => {
                index.insert(key, unique.len());
                unique.push(row);
            }
        }
    }

    let removed = total - unique.len();
    (unique, removed)
}

/// Left join on pool id
pub fn join_pool_metadata(
    rows: Vec<CleanPoolHour>,
    metadata: &BTreeMap<String, PoolMetadata>,
) -> Vec<CleanPoolHour> {
    rows.into_iter()
        .map(|mut row| {
            row.pool = metadata.get(&row.pool_id).cloned();
            row
        })
        .collect()
}

/// Run load → metadata → clean → dedup → join
pub fn build_clean_table(data_dir: &Path, protocols: &[Protocol]) -> Result<CleanTable> {
    let raw = load_raw(data_dir, protocols)?;
    let metadata = pool_metadata(&raw.records);
    let cleaned = clean(&raw.records)?;
    let (deduped, duplicates_removed) = deduplicate(cleaned);
    let rows = join_pool_metadata(deduped, &metadata);

    info!(
        rows = rows.len(),
        pools = metadata.len(),
        duplicates_removed = duplicates_removed,
        "Built clean table"
    );

    Ok(CleanTable {
        rows,
        metadata,
        skipped_lines: raw.skipped_lines,
        duplicates_removed,
    })
}
