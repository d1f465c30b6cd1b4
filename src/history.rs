//! Append-only Execution History: JSON-lines storage with size-based
//! rotation and structured query.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;
use crate::kernel_client::ExecutionStatus;

/// Execution mode a History Entry was recorded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// Code was run through the Kernel Client.
    Kernel,
    /// Code was run through the PTY-style terminal (out of scope here; the
    /// variant exists so History Entries from that path still parse).
    Terminal,
}

/// One persisted Execution Result plus provenance, appended after every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The code or command that was run.
    pub command: String,
    /// Which execution path produced this entry.
    pub mode: Mode,
    /// `"ok"`, `"error"`, or `"abort"`.
    pub status: String,
    /// The documented numeric error code (0 on success).
    pub error_code: u32,
    /// Error category name, present only when `error_code != 0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Runtime label at the time of execution.
    pub runtime_label: String,
    /// Runtime accelerator at the time of execution.
    pub runtime_accelerator: String,
    /// When this entry was recorded.
    #[serde(with = "time::serde::iso8601")]
    pub timestamp: OffsetDateTime,
}

impl HistoryEntry {
    /// Build an entry from an execution outcome.
    pub fn new(
        command: impl Into<String>,
        mode: Mode,
        status: &ExecutionStatus,
        error_code: u32,
        category: Option<String>,
        runtime_label: impl Into<String>,
        runtime_accelerator: impl Into<String>,
    ) -> Self {
        let status_str = match status {
            ExecutionStatus::Ok => "ok",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Abort => "abort",
        };
        Self {
            command: command.into(),
            mode,
            status: status_str.to_string(),
            error_code,
            category,
            runtime_label: runtime_label.into(),
            runtime_accelerator: runtime_accelerator.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Filters accepted by `query()`.
#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    /// `"ok"`, `"error"`, or `"abort"`.
    pub status: Option<String>,
    /// Error category name.
    pub category: Option<String>,
    /// `"kernel"` or `"terminal"`.
    pub mode: Option<Mode>,
    /// ISO-8601 timestamp or a relative form matching `^\d+[smhd]$`.
    pub since: Option<String>,
    /// Maximum number of entries to return.
    pub limit: usize,
}

/// Aggregate counters returned by `getStats()`.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    /// Total entries in the log.
    pub total: usize,
    /// Entries per mode.
    pub by_mode: HashMap<String, usize>,
    /// Entries per error category (excluding successes).
    pub by_category: HashMap<String, usize>,
    /// Fraction of entries with `status = "ok"`.
    pub success_rate: f64,
    /// Timestamp of the oldest entry, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<String>,
    /// Timestamp of the newest entry, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<String>,
}

const ROTATE_THRESHOLD_BYTES: u64 = 10 * 1024 * 1024;
const ROTATE_RETAIN: usize = 1000;

/// Append-only JSON-lines Execution History store.
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    /// `path` is typically `<config dir>/state/history.jsonl`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append one entry, then rotate if the file has grown past threshold.
    pub fn append(&self, entry: &HistoryEntry) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::io(self.path.display().to_string(), err))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| Error::io(self.path.display().to_string(), err))?;
        file.lock_exclusive()
            .map_err(|err| Error::io(self.path.display().to_string(), err))?;

        let line = serde_json::to_string(entry).map_err(|err| Error::json(self.path.display().to_string(), err))?;
        writeln!(file, "{line}").map_err(|err| Error::io(self.path.display().to_string(), err))?;
        FileExt::unlock(&file).map_err(|err| Error::io(self.path.display().to_string(), err))?;
        drop(file);

        self.rotate_if_needed()
    }

    fn rotate_if_needed(&self) -> Result<(), Error> {
        let Ok(metadata) = fs::metadata(&self.path) else {
            return Ok(());
        };
        if metadata.len() <= ROTATE_THRESHOLD_BYTES {
            return Ok(());
        }

        let entries = self.read_all()?;
        let retained: Vec<&HistoryEntry> = entries.iter().rev().take(ROTATE_RETAIN).rev().collect();

        let tmp_path = self.path.with_extension("jsonl.tmp");
        {
            let mut tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .map_err(|err| Error::io(tmp_path.display().to_string(), err))?;
            for entry in retained {
                let line = serde_json::to_string(entry).map_err(|err| Error::json(tmp_path.display().to_string(), err))?;
                writeln!(tmp, "{line}").map_err(|err| Error::io(tmp_path.display().to_string(), err))?;
            }
        }
        fs::rename(&tmp_path, &self.path).map_err(|err| Error::io(self.path.display().to_string(), err))
    }

    fn read_all(&self) -> Result<Vec<HistoryEntry>, Error> {
        let Ok(file) = fs::File::open(&self.path) else {
            return Ok(Vec::new());
        };
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|err| Error::io(self.path.display().to_string(), err))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: HistoryEntry =
                serde_json::from_str(&line).map_err(|err| Error::json(self.path.display().to_string(), err))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Stream the file back-to-front, returning at most `filters.limit`
    /// matching entries, most recent first.
    pub fn query(&self, filters: &QueryFilters) -> Result<Vec<HistoryEntry>, Error> {
        let since_cutoff = filters
            .since
            .as_deref()
            .map(parse_since)
            .transpose()?;

        let entries = self.read_all()?;
        let mut matched = Vec::new();
        for entry in entries.into_iter().rev() {
            if matched.len() >= filters.limit {
                break;
            }
            if let Some(status) = &filters.status {
                if &entry.status != status {
                    continue;
                }
            }
            if let Some(category) = &filters.category {
                if entry.category.as_deref() != Some(category.as_str()) {
                    continue;
                }
            }
            if let Some(mode) = filters.mode {
                if entry.mode != mode {
                    continue;
                }
            }
            if let Some(cutoff) = since_cutoff {
                if entry.timestamp < cutoff {
                    continue;
                }
            }
            matched.push(entry);
        }
        Ok(matched)
    }

    /// Aggregate totals, per-mode counts, per-category error counts,
    /// success rate, and first/last timestamps.
    pub fn get_stats(&self) -> Result<HistoryStats, Error> {
        let entries = self.read_all()?;
        let total = entries.len();
        let mut by_mode = HashMap::new();
        let mut by_category = HashMap::new();
        let mut successes = 0usize;

        for entry in &entries {
            *by_mode.entry(entry.mode.to_string()).or_insert(0) += 1;
            if entry.status == "ok" {
                successes += 1;
            } else if let Some(category) = &entry.category {
                *by_category.entry(category.clone()).or_insert(0) += 1;
            }
        }

        let success_rate = if total == 0 { 0.0 } else { successes as f64 / total as f64 };
        let first = entries.first().map(|e| e.timestamp.to_string());
        let last = entries.last().map(|e| e.timestamp.to_string());

        Ok(HistoryStats {
            total,
            by_mode,
            by_category,
            success_rate,
            first,
            last,
        })
    }

    /// Truncate the history file to empty.
    pub fn clear(&self) -> Result<(), Error> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map(|_| ())
            .map_err(|err| Error::io(self.path.display().to_string(), err))
    }
}

/// Parse a `since` filter: either an ISO-8601 timestamp, or a relative form
/// matching `^\d+[smhd]$` measured back from now.
fn parse_since(raw: &str) -> Result<OffsetDateTime, Error> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &time::format_description::well_known::Iso8601::DEFAULT) {
        return Ok(parsed);
    }

    let (digits, unit) = raw.split_at(raw.len().saturating_sub(1));
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidSinceFilter(raw.to_string()));
    }
    let amount: i64 = digits
        .parse()
        .map_err(|_| Error::InvalidSinceFilter(raw.to_string()))?;
    let seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86400,
        _ => return Err(Error::InvalidSinceFilter(raw.to_string())),
    };
    Ok(OffsetDateTime::now_utc() - time::Duration::seconds(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_entry(status: &str, category: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            command: "print(1)".into(),
            mode: Mode::Kernel,
            status: status.into(),
            error_code: if status == "ok" { 0 } else { 1002 },
            category: category.map(str::to_string),
            runtime_label: "gpu (T4)".into(),
            runtime_accelerator: "T4".into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn appends_and_queries_back_to_front() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store.append(&sample_entry("ok", None)).unwrap();
        store.append(&sample_entry("error", Some("runtime"))).unwrap();

        let results = store
            .query(&QueryFilters {
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, "error");
        assert_eq!(results[1].status, "ok");
    }

    #[test]
    fn query_filters_by_status_and_category() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store.append(&sample_entry("ok", None)).unwrap();
        store.append(&sample_entry("error", Some("import"))).unwrap();

        let results = store
            .query(&QueryFilters {
                status: Some("error".into()),
                category: Some("import".into()),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn parses_relative_since_filter() {
        let cutoff = parse_since("30s").unwrap();
        assert!(cutoff <= OffsetDateTime::now_utc());
    }

    #[test]
    fn rejects_unparsable_since_filter() {
        assert!(parse_since("not-a-time").is_err());
    }

    #[test]
    fn clear_truncates_the_log() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store.append(&sample_entry("ok", None)).unwrap();
        store.clear().unwrap();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn stats_compute_success_rate() {
        let dir = tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("history.jsonl"));
        store.append(&sample_entry("ok", None)).unwrap();
        store.append(&sample_entry("error", Some("runtime"))).unwrap();
        let stats = store.get_stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success_rate, 0.5);
    }
}
