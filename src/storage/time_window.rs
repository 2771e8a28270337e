use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Clock used to cut frames into hourly windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowZone {
    #[default]
    Local,
    Utc,
}

impl WindowZone {
    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        match self {
            WindowZone::Local => now.with_timezone(&Local).date_naive(),
            WindowZone::Utc => now.date_naive(),
        }
    }
}

/// One hourly rotation bucket of one interface.
///
/// Ordering compares interface, then date, then hour, so windows of the same
/// interface sort chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimeWindow {
    pub interface: String,
    pub date: NaiveDate,
    pub hour: u32,
}

impl TimeWindow {
    pub fn new(interface: impl Into<String>, date: NaiveDate, hour: u32) -> Self {
        Self {
            interface: interface.into(),
            date,
            hour: hour.min(23),
        }
    }

    /// Window containing `ts` as seen on the `zone` clock.
    pub fn from_timestamp(interface: &str, ts: DateTime<Utc>, zone: WindowZone) -> Self {
        let (date, hour) = match zone {
            WindowZone::Local => {
                let local = ts.with_timezone(&Local);
                (local.date_naive(), local.hour())
            }
            WindowZone::Utc => (ts.date_naive(), ts.hour()),
        };
        Self::new(interface, date, hour)
    }

    pub fn next(&self) -> Self {
        if self.hour >= 23 {
            let date = self.date.succ_opt().unwrap_or(self.date);
            Self::new(self.interface.clone(), date, 0)
        } else {
            Self::new(self.interface.clone(), self.date, self.hour + 1)
        }
    }

    /// First instant of this window, `None` when a local-time gap swallows it.
    pub fn start(&self, zone: WindowZone) -> Option<DateTime<Utc>> {
        let naive = self.date.and_hms_opt(self.hour, 0, 0)?;
        match zone {
            WindowZone::Utc => Some(Utc.from_utc_datetime(&naive)),
            WindowZone::Local => Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }

    /// Instant at which the next window opens.
    pub fn end(&self, zone: WindowZone) -> Option<DateTime<Utc>> {
        self.next()
            .start(zone)
            .or_else(|| self.start(zone).map(|s| s + Duration::hours(1)))
    }

    pub fn date_str(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// `YYYY-MM-DD_HH`
    pub fn label(&self) -> String {
        format!("{}_{:02}", self.date_str(), self.hour)
    }

    /// `<interface>_<YYYY-MM-DD>_<HH>`
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.interface, self.label())
    }

    pub fn capture_dir(&self, root: &Path) -> PathBuf {
        root.join("raw").join(self.date_str())
    }

    pub fn capture_path(&self, root: &Path) -> PathBuf {
        self.capture_dir(root)
            .join(format!("{}.pcap", self.file_stem()))
    }

    /// Sibling file used when the window was already written by an earlier run.
    pub fn numbered_capture_path(&self, root: &Path, n: u32) -> PathBuf {
        self.capture_dir(root)
            .join(format!("{}.{}.pcap", self.file_stem(), n))
    }

    pub fn module_dir(&self, root: &Path, module: &str) -> PathBuf {
        root.join("modules").join(module).join(self.date_str())
    }

    /// `(summary.json, index.jsonl)` paths of `module` for this window.
    pub fn module_output_paths(&self, root: &Path, module: &str) -> (PathBuf, PathBuf) {
        let dir = self.module_dir(root, module);
        let stem = self.file_stem();
        (
            dir.join(format!("{}.summary.json", stem)),
            dir.join(format!("{}.index.jsonl", stem)),
        )
    }

    /// Recovers the window from a capture file name such as
    /// `eth0_2024-05-01_13.pcap` or `eth0_2024-05-01_13.2.pcap`.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".pcap")?;
        let stem = match stem.rsplit_once('.') {
            Some((base, n)) if n.chars().all(|c| c.is_ascii_digit()) => base,
            Some(_) => return None,
            None => stem,
        };
        let mut parts = stem.rsplitn(3, '_');
        let hour: u32 = parts.next()?.parse().ok()?;
        let date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
        let interface = parts.next()?;
        if interface.is_empty() || hour > 23 {
            return None;
        }
        Some(Self::new(interface, date, hour))
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.interface, self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn window_is_keyed_by_hour() {
        let a = TimeWindow::from_timestamp("eth0", utc(2024, 5, 1, 13, 59), WindowZone::Utc);
        let b = TimeWindow::from_timestamp("eth0", utc(2024, 5, 1, 14, 0), WindowZone::Utc);
        assert_eq!(a.label(), "2024-05-01_13");
        assert_eq!(a.next(), b);
        assert!(a < b);
    }

    #[test]
    fn next_rolls_over_midnight() {
        let w = TimeWindow::new("eth0", NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(), 23);
        let n = w.next();
        assert_eq!(n.date, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
        assert_eq!(n.hour, 0);
        assert_eq!(w.end(WindowZone::Utc), Some(utc(2025, 1, 1, 0, 0)));
    }

    #[test]
    fn paths_follow_directory_layout() {
        let w = TimeWindow::new("eth0", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), 7);
        let root = Path::new("/data");
        assert_eq!(
            w.capture_path(root),
            PathBuf::from("/data/raw/2024-05-01/eth0_2024-05-01_07.pcap")
        );
        let (summary, index) = w.module_output_paths(root, "protocol_stats");
        assert_eq!(
            summary,
            PathBuf::from("/data/modules/protocol_stats/2024-05-01/eth0_2024-05-01_07.summary.json")
        );
        assert!(index.ends_with("eth0_2024-05-01_07.index.jsonl"));
    }

    #[test]
    fn file_names_parse_back() {
        let w = TimeWindow::new("wlan_0", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), 9);
        let plain = w.capture_path(Path::new("/r"));
        let numbered = w.numbered_capture_path(Path::new("/r"), 2);
        for path in [plain, numbered] {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert_eq!(TimeWindow::from_file_name(name), Some(w.clone()));
        }
        assert_eq!(TimeWindow::from_file_name("notes.txt"), None);
        assert_eq!(TimeWindow::from_file_name("eth0_2024-05-01_25.pcap"), None);
    }
}
