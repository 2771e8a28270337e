use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::storage::time_window::TimeWindow;

/// Dates with a `raw/<date>` directory under `root`, oldest first.
pub fn available_dates(root: &Path) -> io::Result<Vec<NaiveDate>> {
    let raw = root.join("raw");
    let entries = match fs::read_dir(&raw) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut dates: Vec<NaiveDate> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| NaiveDate::parse_from_str(n, "%Y-%m-%d").ok())
        })
        .collect();
    dates.sort();
    Ok(dates)
}

/// Capture files under `root`, optionally restricted to one interface and/or
/// one date, sorted by window then name.
pub fn list_capture_files(
    root: &Path,
    interface: Option<&str>,
    date: Option<NaiveDate>,
) -> io::Result<Vec<(TimeWindow, PathBuf)>> {
    let dates = match date {
        Some(d) => vec![d],
        None => available_dates(root)?,
    };

    let mut files = Vec::new();
    for d in dates {
        let dir = root.join("raw").join(d.format("%Y-%m-%d").to_string());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let window = match path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(TimeWindow::from_file_name)
            {
                Some(w) => w,
                None => continue,
            };
            if interface.is_some_and(|i| i != window.interface) {
                continue;
            }
            files.push((window, path));
        }
    }
    files.sort();
    Ok(files)
}
