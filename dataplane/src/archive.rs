//! Archiving of duplicated raw files
//!
//! The fetcher can be re-run for the same hour, leaving several raw files
//! that cover it. Only the last one (file-name order) is kept in place.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::Result;

/// Files kept and moved for one hour
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedGroup {
    pub hour_key: String,
    pub kept: String,
    pub archived: Vec<String>,
}

/// Result of one archive pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveReport {
    pub groups: Vec<ArchivedGroup>,
    pub ignored: Vec<String>,
}

impl ArchiveReport {
    pub fn archived_count(&self) -> usize {
        self.groups.iter().map(|g| g.archived.len()).sum()
    }
}

/// Hour key of a raw file name.
///
/// `YYYYMMDDTHHMMSS_pool.jsonl` drops minutes and seconds to
/// `YYYYMMDDTHH0000`. A daily dump `YYYY-MM-DD_pool.jsonl` keeps its dashed
/// date as `YYYY-MM-DDT000000`, so it never shares a group with hourly files.
/// Anything else has no key.
pub fn hour_key(file_name: &str) -> Option<String> {
    let stem = file_name.strip_suffix("_pool.jsonl")?;
    let bytes = stem.as_bytes();
    let digits = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_digit);

    match bytes.len() {
        10 if bytes[4] == b'-' && bytes[7] == b'-' && digits(0..4) && digits(5..7) && digits(8..10) => {
            Some(format!("{}T000000", stem))
        }
        15 if bytes[8] == b'T' && digits(0..8) && digits(9..15) => {
            Some(format!("{}0000", &stem[..11]))
        }
        _ => None,
    }
}

/// Move all but the last file of each duplicated hour into `archive_dir`
pub fn archive_duplicates(dir: &Path, archive_dir: &Path) -> Result<ArchiveReport> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut report = ArchiveReport::default();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !name.ends_with("_pool.jsonl") {
            continue;
        }
        match hour_key(&name) {
            Some(key) => groups.entry(key).or_default().push(name),
            None => report.ignored.push(name),
        }
    }

    for (hour_key, mut files) in groups {
        if files.len() < 2 {
            continue;
        }
        files.sort();
        let kept = files.pop().unwrap_or_default();

        std::fs::create_dir_all(archive_dir)?;
        for file in &files {
            let target: PathBuf = archive_dir.join(file);
            std::fs::rename(dir.join(file), &target)?;
        }

        info!(hour = %hour_key, kept = %kept, archived = files.len(), "Archived duplicate raw files");
        report.groups.push(ArchivedGroup {
            hour_key,
            kept,
            archived: files,
        });
    }

    Ok(report)
}
