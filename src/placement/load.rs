use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DocHostError, Result};

/// Resource state reported by a worker's telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLoad {
    #[serde(rename = "freeMemoryMB")]
    pub free_memory_mb: f64,
    #[serde(rename = "totalMemoryMB")]
    pub total_memory_mb: f64,
    pub total_assignments_count: u64,
    #[serde(default)]
    pub new_assignments_count: u64,
    #[serde(default)]
    pub loading_docs_count: u64,
}

impl WorkerLoad {
    /// An idle worker with all of its memory free.
    pub fn idle(total_memory_mb: f64) -> Self {
        Self {
            free_memory_mb: total_memory_mb,
            total_memory_mb,
            total_assignments_count: 0,
            new_assignments_count: 0,
            loading_docs_count: 0,
        }
    }
}

/// One candidate worker. `load` is `None` when telemetry has nothing for it yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLoadReport {
    pub worker_id: String,
    #[serde(default)]
    pub load: Option<WorkerLoad>,
}

impl WorkerLoadReport {
    pub fn new(worker_id: impl Into<String>, load: Option<WorkerLoad>) -> Self {
        Self {
            worker_id: worker_id.into(),
            load,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker_id.is_empty() {
            return Err(DocHostError::InvalidReport("empty workerId".to_string()));
        }
        if let Some(load) = &self.load {
            let valid = load.free_memory_mb.is_finite()
                && load.total_memory_mb.is_finite()
                && load.free_memory_mb >= 0.0
                && load.total_memory_mb >= 0.0;
            if !valid {
                return Err(DocHostError::InvalidReport(format!(
                    "worker {} reports invalid memory figures",
                    self.worker_id
                )));
            }
        }
        Ok(())
    }
}

/// Parse a JSON array of load reports.
pub fn load_reports<R: Read>(reader: R) -> Result<Vec<WorkerLoadReport>> {
    let reports: Vec<WorkerLoadReport> = serde_json::from_reader(reader)?;
    for report in &reports {
        report.validate()?;
    }
    Ok(reports)
}

pub fn load_reports_file(path: &Path) -> Result<Vec<WorkerLoadReport>> {
    let file = File::open(path)?;
    load_reports(BufReader::new(file))
}
