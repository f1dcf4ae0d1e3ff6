//! Cost records for upstream calls.
//!
//! Every call that reaches upstream produces exactly one [`CostRecord`],
//! appended to a [`CostSink`]. Sinks are append-only: nothing here edits or
//! removes a record. Aggregation lives in `partscan_core::ledger`.
//!
//! Sinks are async so file I/O runs on the blocking pool, never on the
//! executor threads that serve requests.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use partscan_core::models::{CostKind, CostRecord};

use crate::config::ModelConfig;
use crate::remote::Usage;

/// Per-million-token pricing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl From<&ModelConfig> for Pricing {
    fn from(config: &ModelConfig) -> Self {
        Self {
            input_per_mtok: config.input_cost_per_mtok,
            output_per_mtok: config.output_cost_per_mtok,
        }
    }
}

/// Cost of one call. A reply without usage costs nothing but is still recorded.
pub fn estimate_cost(usage: Option<Usage>, pricing: Pricing) -> f64 {
    match usage {
        Some(u) => {
            (u.input_tokens as f64 * pricing.input_per_mtok
                + u.output_tokens as f64 * pricing.output_per_mtok)
                / 1_000_000.0
        }
        None => 0.0,
    }
}

/// Build a record stamped with the current time.
pub fn record_for(
    user_id: &str,
    scan_id: Option<&str>,
    kind: CostKind,
    usage: Option<Usage>,
    pricing: Pricing,
) -> CostRecord {
    let usage_or_zero = usage.unwrap_or_default();
    CostRecord {
        user_id: user_id.to_string(),
        scan_id: scan_id.map(str::to_string),
        kind,
        cost: estimate_cost(usage, pricing),
        input_tokens: usage_or_zero.input_tokens,
        output_tokens: usage_or_zero.output_tokens,
        timestamp: Utc::now(),
    }
}

/// Append-only destination for cost records. `append` returns once the
/// record is durable in the sink.
#[async_trait]
pub trait CostSink: Send + Sync {
    async fn append(&self, record: CostRecord);

    /// Copy of every record appended so far.
    async fn snapshot(&self) -> Vec<CostRecord>;
}

#[derive(Debug, Default)]
pub struct MemoryCostLog {
    records: Mutex<Vec<CostRecord>>,
}

impl MemoryCostLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CostSink for MemoryCostLog {
    async fn append(&self, record: CostRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    async fn snapshot(&self) -> Vec<CostRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

/// JSON Lines file sink. One record per line, opened in append mode.
#[derive(Debug)]
pub struct JsonlCostLog {
    path: PathBuf,
    // serializes writers within this process
    lock: tokio::sync::Mutex<()>,
}

impl JsonlCostLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

fn write_line(path: &Path, record: &CostRecord) -> Result<()> {
    let line = serde_json::to_string(record)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open cost log: {}", path.display()))?;
    writeln!(file, "{}", line)?;
    Ok(())
}

#[async_trait]
impl CostSink for JsonlCostLog {
    async fn append(&self, record: CostRecord) {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || write_line(&path, &record))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
        if let Err(e) = written {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to append cost record");
        }
    }

    async fn snapshot(&self) -> Vec<CostRecord> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        let read = tokio::task::spawn_blocking(move || read_cost_records(&path))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
        match read {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to read cost log");
                Vec::new()
            }
        }
    }
}

/// Read a JSON Lines cost log. A missing file is an empty log; blank lines
/// are skipped; a malformed line is an error naming its line number.
pub fn read_cost_records(path: &Path) -> Result<Vec<CostRecord>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open cost log: {}", path.display()))
        }
    };

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: CostRecord = serde_json::from_str(&line)
            .with_context(|| format!("Invalid cost record on line {}", idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRICING: Pricing = Pricing {
        input_per_mtok: 2.0,
        output_per_mtok: 8.0,
    };

    #[test]
    fn test_estimate_cost() {
        let usage = Usage {
            input_tokens: 1_000,
            output_tokens: 500,
        };
        let cost = estimate_cost(Some(usage), PRICING);
        assert!((cost - 0.006).abs() < 1e-12);
        assert_eq!(estimate_cost(None, PRICING), 0.0);
    }

    #[tokio::test]
    async fn test_memory_log_appends() {
        let log = MemoryCostLog::new();
        assert!(log.is_empty());
        log.append(record_for("u1", Some("s1"), CostKind::Scan, None, PRICING))
            .await;
        log.append(record_for("u1", None, CostKind::Match, None, PRICING))
            .await;
        let snap = log.snapshot().await;
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].scan_id.as_deref(), Some("s1"));
        assert_eq!(snap[1].kind, CostKind::Match);
    }

    #[tokio::test]
    async fn test_jsonl_log_persists() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("costs.jsonl");
        let log = JsonlCostLog::new(&path);
        assert!(log.snapshot().await.is_empty());

        let usage = Some(Usage {
            input_tokens: 10,
            output_tokens: 5,
        });
        log.append(record_for("u1", Some("s1"), CostKind::Scan, usage, PRICING))
            .await;
        log.append(record_for("u2", None, CostKind::Correction, None, PRICING))
            .await;

        let reopened = JsonlCostLog::new(&path);
        let records = reopened.snapshot().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].input_tokens, 10);
        assert_eq!(records[1].user_id, "u2");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_jsonl_concurrent_appends_keep_whole_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = std::sync::Arc::new(JsonlCostLog::new(tmp.path().join("costs.jsonl")));

        let writers: Vec<_> = (0..16)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move {
                    let user = format!("u{}", i);
                    log.append(record_for(&user, None, CostKind::Scan, None, PRICING))
                        .await;
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let records = log.snapshot().await;
        assert_eq!(records.len(), 16);
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("costs.jsonl");
        std::fs::write(&path, "\n{not json}\n").unwrap();
        let err = read_cost_records(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
