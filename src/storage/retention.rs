use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use chrono::{Duration, NaiveDate};
use log::{info, warn};

use crate::error_handling::types::RetentionError;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub failures: usize,
}

/// Oldest date that is kept for `today` and a horizon of `retention_days`.
/// `None` when retention is disabled (0 days).
pub fn cutoff(today: NaiveDate, retention_days: u32) -> Option<NaiveDate> {
    if retention_days == 0 {
        return None;
    }
    today.checked_sub_signed(Duration::days(retention_days as i64))
}

/// Deletes every `raw/<date>` directory under `root` whose date is strictly older
/// than `today - retention_days`.
///
/// Best effort: a file that cannot be removed is counted and logged, the scan
/// continues. Only an unreadable `raw/` directory is reported as an error.
pub fn apply(root: &Path, today: NaiveDate, retention_days: u32) -> Result<RetentionReport, RetentionError> {
    let mut report = RetentionReport::default();
    let cutoff = match cutoff(today, retention_days) {
        Some(c) => c,
        None => return Ok(report),
    };

    let raw = root.join("raw");
    let entries = match fs::read_dir(&raw) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
        Err(source) => return Err(RetentionError::Scan { path: raw, source }),
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let date = match entry
            .file_name()
            .to_str()
            .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok())
        {
            Some(date) => date,
            None => continue,
        };
        if date >= cutoff {
            continue;
        }

        match purge_dir(&dir, &mut report) {
            Ok(()) => {}
            Err(e) => {
                report.failures += 1;
                warn!("{}", e);
            }
        }
    }

    if report.files_removed > 0 || report.failures > 0 {
        info!(
            "Retention removed {} files in {} directories older than {} ({} failures)",
            report.files_removed, report.dirs_removed, cutoff, report.failures
        );
    }
    Ok(report)
}

fn purge_dir(dir: &Path, report: &mut RetentionReport) -> Result<(), RetentionError> {
    let entries = fs::read_dir(dir).map_err(|source| RetentionError::Scan {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => report.files_removed += 1,
            Err(source) => {
                report.failures += 1;
                warn!("{}", RetentionError::Remove { path, source });
            }
        }
    }
    fs::remove_dir(dir).map_err(|source| RetentionError::Remove {
        path: dir.to_path_buf(),
        source,
    })?;
    report.dirs_removed += 1;
    Ok(())
}
