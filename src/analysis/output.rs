//! Persistence of module results. Every file is written to a temporary sibling
//! and renamed into place, so a failed run never leaves a partial output.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;

use crate::analysis::module_trait::{Detection, ModuleSummary};
use crate::error_handling::types::ModuleError;

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Incremental detection stream of one (module, window) run.
pub struct DetectionWriter {
    path: PathBuf,
    tmp: PathBuf,
    out: Option<BufWriter<File>>,
    count: u64,
    cancelled: Arc<AtomicBool>,
}

impl DetectionWriter {
    pub fn create(path: &Path) -> Result<Self, ModuleError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(path);
        let file = File::create(&tmp)?;
        Ok(Self {
            path: path.to_path_buf(),
            tmp,
            out: Some(BufWriter::new(file)),
            count: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Flag checked on every emit; set by the runner when the run times out.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn emit(&mut self, detection: &Detection) -> Result<(), ModuleError> {
        if self.is_cancelled() {
            return Err(ModuleError::Cancelled);
        }
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| ModuleError::Failed("detection stream already committed".into()))?;
        serde_json::to_writer(&mut *out, detection)?;
        out.write_all(b"\n")?;
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Publishes the stream at its final path, replacing any earlier run.
    pub fn commit(mut self) -> Result<PathBuf, ModuleError> {
        if self.is_cancelled() {
            return Err(ModuleError::Cancelled);
        }
        if let Some(out) = self.out.take() {
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&self.tmp, &self.path)?;
        debug!("Wrote {} detections to {}", self.count, self.path.display());
        Ok(self.path.clone())
    }
}

impl Drop for DetectionWriter {
    fn drop(&mut self) {
        if self.out.take().is_some() {
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

pub fn write_summary(path: &Path, summary: &ModuleSummary) -> Result<(), ModuleError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    let result = (|| -> Result<(), ModuleError> {
        let mut out = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut out, summary)?;
        out.write_all(b"\n")?;
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

pub fn read_summary(path: &Path) -> Result<ModuleSummary, ModuleError> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Reads a detection index, skipping lines that do not parse.
pub fn read_detections(path: &Path) -> Result<Vec<Detection>, ModuleError> {
    let file = File::open(path)?;
    let mut detections = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(det) = serde_json::from_str(&line) {
            detections.push(det);
        }
    }
    Ok(detections)
}
