//! Analysis module contract and the records modules produce.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::output::DetectionWriter;
use crate::error_handling::types::ModuleError;
use crate::storage::time_window::TimeWindow;

/// A pluggable analysis job run against every completed capture file.
///
/// `analyze` runs on a blocking worker. It reads `capture`, emits detections
/// incrementally through `detections` and returns the window summary; the
/// runner persists both.
pub trait AnalysisModule: Send + Sync {
    /// Lowercase identifier, also the output directory name.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        "No description"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn analyze(
        &self,
        capture: &Path,
        output_dir: &Path,
        interface: &str,
        window: &TimeWindow,
        detections: &mut DetectionWriter,
    ) -> Result<ModuleSummary, ModuleError>;
}

/// One flagged event. Label-specific attributes are flattened into the JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub seq: u64,
    pub ts_sec: i64,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Detection {
    pub fn new(seq: u64, ts_sec: i64, label: impl Into<String>) -> Self {
        Self {
            seq,
            ts_sec,
            label: label.into(),
            src: None,
            dst: None,
            src_port: None,
            dst_port: None,
            proto: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// Per (module, window) result record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub module: String,
    pub interface: String,
    pub time_window: String,
    pub capture_file: PathBuf,
    pub total_packets: u64,
    pub analyzed_packets: u64,
    pub total_detections: u64,
    pub labels: BTreeMap<String, u64>,
    pub top_sources: Vec<(String, u64)>,
    pub top_destinations: Vec<(String, u64)>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ModuleSummary {
    pub fn new(module: &str, window: &TimeWindow, capture: &Path) -> Self {
        let now = Utc::now();
        Self {
            module: module.to_string(),
            interface: window.interface.clone(),
            time_window: window.label(),
            capture_file: capture.to_path_buf(),
            total_packets: 0,
            analyzed_packets: 0,
            total_detections: 0,
            labels: BTreeMap::new(),
            top_sources: Vec::new(),
            top_destinations: Vec::new(),
            started_at: now,
            finished_at: now,
            duration_secs: 0.0,
            errors: Vec::new(),
        }
    }

    /// Stamps the end time and duration.
    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self.duration_secs = (self.finished_at - self.started_at)
            .num_microseconds()
            .unwrap_or(0) as f64
            / 1e6;
        self
    }
}

/// The `n` largest counts, ties broken by key so output is stable.
pub fn top_n(counts: &HashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}
