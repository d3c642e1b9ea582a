//! Utility functions and helpers for the dataplane

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{DataplaneError, Result};

/// Retry configuration for operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Overall budget across all attempts; no further attempt starts once spent
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            deadline: None,
        }
    }
}

/// Retry a future with exponential backoff.
///
/// Only errors accepted by `should_retry` are retried; anything else is
/// returned immediately.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    operation: F,
    config: RetryConfig,
    operation_name: &str,
    should_retry: P,
) -> std::result::Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            operation = operation_name,
            attempt = attempt,
            max_attempts = config.max_attempts,
            "Attempting operation"
        );

        let error = match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation_name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(error) => error,
        };

        let out_of_attempts = attempt >= config.max_attempts;
        let out_of_time = config
            .deadline
            .map(|deadline| started.elapsed() + delay > deadline)
            .unwrap_or(false);

        if !should_retry(&error) || out_of_attempts || out_of_time {
            warn!(
                operation = operation_name,
                attempt = attempt,
                retryable = should_retry(&error),
                error = %error,
                "Operation failed, giving up"
            );
            return Err(error);
        }

        warn!(
            operation = operation_name,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Operation failed, retrying"
        );
        sleep(delay).await;
        delay = std::cmp::min(delay.mul_f64(config.backoff_multiplier), config.max_delay);
    }
}

/// Convert a Unix timestamp to a DateTime<Utc>
pub fn timestamp_to_datetime(timestamp: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
}

/// Truncate to the start of the hour
pub fn truncate_to_hour(time: DateTime<Utc>) -> DateTime<Utc> {
    time.duration_trunc(ChronoDuration::hours(1)).unwrap_or(time)
}

/// Parse an interval end given as RFC 3339, `Z` or explicit offset
pub fn parse_interval_end(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DataplaneError::InvalidInterval(format!("{}: {}", value, e)))
}

/// Mask an entity id for logging: first six characters then `...`
pub fn mask_entity_id(entity_id: &str) -> String {
    let prefix: String = entity_id.chars().take(6).collect();
    format!("{}...", prefix)
}

/// Parse a decimal string carried by the subgraph
pub fn parse_decimal(field: &str, record_id: &str, value: &str) -> Result<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| DataplaneError::invalid_value(field, record_id, value))
}

/// Read a JSONL file. Malformed lines are skipped and counted.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, usize)> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut items = Vec::new();
    let mut skipped = 0;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(item) => items.push(item),
            Err(e) => {
                skipped += 1;
                warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %e,
                    "Skipping malformed JSONL line"
                );
            }
        }
    }

    Ok((items, skipped))
}

/// Write items as JSONL, creating parent directories
pub fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut writer = BufWriter::new(std::fs::File::create(path)?);
    for item in items {
        serde_json::to_writer(&mut writer, item)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Calculate simple moving average from a window of values
pub fn simple_moving_average(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Calculate sample standard deviation from a window of values
pub fn standard_deviation(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }

    let mean = simple_moving_average(values);
    let variance = values.iter()
        .map(|x| (x - mean).powi(2))
        .sum::<f64>() / (values.len() - 1) as f64;

    variance.sqrt()
}

/// Calculate percentile (0.0..=1.0) from a sorted array of values
pub fn percentile(sorted_values: &[f64], percentile: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    if percentile <= 0.0 {
        return sorted_values[0];
    }

    if percentile >= 1.0 {
        return sorted_values[sorted_values.len() - 1];
    }

    let index = percentile * (sorted_values.len() - 1) as f64;
    let lower_index = index.floor() as usize;
    let upper_index = index.ceil() as usize;

    if lower_index == upper_index {
        sorted_values[lower_index]
    } else {
        let weight = index - lower_index as f64;
        sorted_values[lower_index] * (1.0 - weight) + sorted_values[upper_index] * weight
    }
}

/// Relative change `(new - old) / old`, 0 when `old` is 0
pub fn rate_of_change(old_value: f64, new_value: f64) -> f64 {
    if old_value == 0.0 {
        return 0.0;
    }
    (new_value - old_value) / old_value
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<u32, String> = retry_with_backoff(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err("unavailable".to_string()) } else { Ok(n) }
            },
            fast_retry(5),
            "test",
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), String> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad request".to_string())
            },
            fast_retry(5),
            "test",
            |e| e.contains("unavailable"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_respects_deadline() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            max_attempts: 100,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 1.0,
            deadline: Some(Duration::from_millis(120)),
        };
        let result: std::result::Result<(), String> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("unavailable".to_string())
            },
            config,
            "test",
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert!(calls.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_parse_interval_end() {
        let z = parse_interval_end("2024-10-04T12:00:00Z").unwrap();
        let offset = parse_interval_end("2024-10-04T21:00:00+09:00").unwrap();
        assert_eq!(z, offset);
        assert!(parse_interval_end("yesterday").is_err());
    }

    #[test]
    fn test_truncate_to_hour() {
        let t = Utc.with_ymd_and_hms(2024, 10, 4, 12, 34, 56).unwrap();
        assert_eq!(truncate_to_hour(t), Utc.with_ymd_and_hms(2024, 10, 4, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_mask_entity_id() {
        assert_eq!(mask_entity_id("0x1234567890abcdef"), "0x1234...");
        assert_eq!(mask_entity_id("0x1"), "0x1...");
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal("volumeUSD", "r1", "12.5").unwrap(), 12.5);
        assert!(matches!(
            parse_decimal("volumeUSD", "r1", "abc"),
            Err(DataplaneError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_jsonl_round_trip_skips_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.jsonl");
        write_jsonl(&path, &[serde_json::json!({"a": 1}), serde_json::json!({"a": 2})]).unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        let (rows, skipped): (Vec<serde_json::Value>, usize) = read_jsonl(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_simple_moving_average() {
        assert_eq!(simple_moving_average(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3.0);
        assert_eq!(simple_moving_average(&[]), 0.0);
        assert_eq!(simple_moving_average(&[5.0]), 5.0);
    }

    #[test]
    fn test_standard_deviation_is_sample() {
        assert_eq!(standard_deviation(&[2.0]), 0.0);
        assert!((standard_deviation(&[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_percentile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 0.5), 3.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 1.0), 5.0);
    }

    #[test]
    fn test_rate_of_change() {
        assert_eq!(rate_of_change(100.0, 150.0), 0.5);
        assert_eq!(rate_of_change(0.0, 10.0), 0.0);
    }
}
