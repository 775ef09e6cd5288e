//! Per-slice records and run-level counters.
//!
//! Every slice accumulates a key/value parameter map during its cycle
//! (working distance, beam shift, stage position, measured resolution, ...)
//! and persists it as one YAML document under
//! `<log_dir>/<slice:05>/record.yaml`. Run-level counters are plain atomics
//! snapshotted on demand for status display.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to write slice record: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize slice record: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

/// The parameter map of one slice, written once at the end of its cycle.
#[derive(Clone, Debug, Serialize)]
pub struct SliceRecord {
    pub slice_number: u64,
    /// Wall-clock start of the slice cycle, RFC 3339.
    pub started_at: String,
    values: BTreeMap<String, serde_yaml::Value>,
}

impl SliceRecord {
    pub fn new(slice_number: u64) -> Self {
        Self {
            slice_number,
            started_at: chrono::Local::now().to_rfc3339(),
            values: BTreeMap::new(),
        }
    }

    /// Adds one parameter. Unserializable values are dropped with a warning
    /// rather than failing the cycle.
    pub fn set(&mut self, key: &str, value: impl Serialize) {
        match serde_yaml::to_value(value) {
            Ok(v) => {
                self.values.insert(key.to_string(), v);
            }
            Err(e) => warn!(key, error = %e, "dropping unserializable record value"),
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_yaml::Value> {
        self.values.get(key)
    }

    /// The per-slice directory under `log_dir`, zero-padded to five digits.
    pub fn slice_dir(log_dir: &Path, slice_number: u64) -> PathBuf {
        log_dir.join(format!("{slice_number:05}"))
    }

    /// Writes `record.yaml` into the slice directory, creating it.
    pub fn write(&self, log_dir: &Path) -> Result<PathBuf, TelemetryError> {
        let dir = Self::slice_dir(log_dir, self.slice_number);
        fs::create_dir_all(&dir)?;
        let path = dir.join("record.yaml");
        fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(path)
    }
}

/// Run-level counters, shared across threads.
#[derive(Debug, Default)]
pub struct RunMetrics {
    slices_completed: AtomicU64,
    autofunction_runs: AtomicU64,
    escalations: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub slices_completed: u64,
    pub autofunction_runs: u64,
    pub escalations: u64,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_slice_completed(&self) {
        self.slices_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_autofunction_run(&self) {
        self.autofunction_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            slices_completed: self.slices_completed.load(Ordering::Relaxed),
            autofunction_runs: self.autofunction_runs.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
        }
    }
}
