//! Invocation records for the observability boundary.
//!
//! Every flow invocation emits exactly one [`FlowInvocationRecord`], whether
//! it returned, was repaired, or failed. Records are transient: the pipeline
//! hands them to an [`InvocationObserver`] and keeps nothing.
//!
//! # Log Format
//!
//! [`JsonlRecorder`] appends newline-delimited JSON:
//!
//! ```jsonl
//! {"flow":"description","promptHash":"3f2a...","modelLatencyMs":812,"attemptCount":1,"outcome":"success",...}
//! {"flow":"review","promptHash":"9c01...","modelLatencyMs":2310,"attemptCount":3,"outcome":"failed",...}
//! ```
use crate::schema::FlowId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success,
    ValidationRepaired,
    Failed,
}

impl InvocationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationOutcome::Success => "success",
            InvocationOutcome::ValidationRepaired => "validation_repaired",
            InvocationOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowInvocationRecord {
    pub flow: FlowId,
    pub prompt_hash: String,
    pub model_latency_ms: u64,
    pub attempt_count: u32,
    pub outcome: InvocationOutcome,
    pub backend: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Consumer of invocation records. Implementations must not fail the flow.
pub trait InvocationObserver: Send + Sync {
    fn record(&self, record: &FlowInvocationRecord);
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl InvocationObserver for TracingObserver {
    fn record(&self, record: &FlowInvocationRecord) {
        tracing::info!(
            flow = record.flow.as_str(),
            prompt_hash = %record.prompt_hash,
            model_latency_ms = record.model_latency_ms,
            attempt_count = record.attempt_count,
            outcome = record.outcome.as_str(),
            backend = %record.backend,
            "flow invocation"
        );
    }
}

/// Appends records to a JSONL file.
#[derive(Debug)]
pub struct JsonlRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn append(&self, record: &FlowInvocationRecord) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("create invocation record directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {} for append", self.path.display()))?;
        let line = serde_json::to_string(record).context("serialize invocation record")?;
        writeln!(file, "{}", line).context("write invocation record")?;
        Ok(())
    }
}

impl InvocationObserver for JsonlRecorder {
    fn record(&self, record: &FlowInvocationRecord) {
        if let Err(err) = self.append(record) {
            tracing::warn!(path = %self.path.display(), error = %err, "drop invocation record");
        }
    }
}

/// Load records written by [`JsonlRecorder`], skipping corrupt lines.
pub fn load_records(path: &Path) -> Result<Vec<FlowInvocationRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut records = Vec::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read line {} of {}", line_num + 1, path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<FlowInvocationRecord>(&line) {
            Ok(record) => records.push(record),
            Err(err) => tracing::warn!(line = line_num + 1, error = %err, "skip corrupt record"),
        }
    }
    Ok(records)
}

/// Per-flow totals over a set of records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
    pub invocations: u64,
    pub success: u64,
    pub validation_repaired: u64,
    pub failed: u64,
    pub attempts: u64,
    pub mean_latency_ms: u64,
}

pub fn summarize_records(records: &[FlowInvocationRecord]) -> BTreeMap<FlowId, FlowSummary> {
    let mut summary: BTreeMap<FlowId, FlowSummary> = BTreeMap::new();
    let mut latency: BTreeMap<FlowId, u64> = BTreeMap::new();
    for record in records {
        let entry = summary.entry(record.flow).or_default();
        entry.invocations += 1;
        entry.attempts += u64::from(record.attempt_count);
        match record.outcome {
            InvocationOutcome::Success => entry.success += 1,
            InvocationOutcome::ValidationRepaired => entry.validation_repaired += 1,
            InvocationOutcome::Failed => entry.failed += 1,
        }
        *latency.entry(record.flow).or_default() += record.model_latency_ms;
    }
    for (flow, entry) in summary.iter_mut() {
        entry.mean_latency_ms = latency.get(flow).copied().unwrap_or(0) / entry.invocations;
    }
    summary
}

/// Keeps records in memory, for reports and tests.
#[derive(Debug, Default)]
pub struct MemoryObserver {
    records: Mutex<Vec<FlowInvocationRecord>>,
}

impl MemoryObserver {
    pub fn records(&self) -> Vec<FlowInvocationRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl InvocationObserver for MemoryObserver {
    fn record(&self, record: &FlowInvocationRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
    }
}

/// Forwards every record to each inner observer.
#[derive(Default)]
pub struct Fanout {
    observers: Vec<Arc<dyn InvocationObserver>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn InvocationObserver>) -> Self {
        self.observers.push(observer);
        self
    }
}

impl InvocationObserver for Fanout {
    fn record(&self, record: &FlowInvocationRecord) {
        for observer in &self.observers {
            observer.record(record);
        }
    }
}
