use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::decoder::types::{LinkType, RawFrame};
use crate::error_handling::types::PersistenceError;
use crate::storage::capture_writer::CaptureWriter;
use crate::storage::retention;
use crate::storage::storage_trait::FrameSink;
use crate::storage::time_window::{TimeWindow, WindowZone};

const MAX_SIBLINGS: u32 = 1000;

/// A closed, immutable capture file ready for analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedCapture {
    pub path: PathBuf,
    pub window: TimeWindow,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct RotatorConfig {
    pub root: PathBuf,
    pub interface: String,
    pub snaplen: u32,
    pub link_type: LinkType,
    pub retention_days: u32,
    pub zone: WindowZone,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RotatorStatus {
    pub current_file: Option<PathBuf>,
    pub current_window: Option<TimeWindow>,
    pub next_rotation: Option<DateTime<Utc>>,
    pub files_completed: u64,
    pub packets_written: u64,
    pub bytes_written: u64,
}

struct OpenCapture {
    window: TimeWindow,
    writer: CaptureWriter,
}

/// Owns the single writable capture file of one interface and swaps it on hour
/// boundaries.
///
/// Every closed file is sent exactly once on the handoff channel. A closed
/// window is never reopened: frames stamped into it go to the next window.
pub struct Rotator {
    config: RotatorConfig,
    current: Option<OpenCapture>,
    last_closed: Option<TimeWindow>,
    handoff: mpsc::UnboundedSender<CompletedCapture>,
    status: watch::Sender<RotatorStatus>,
    files_completed: u64,
    packets_written: u64,
    bytes_written: u64,
}

impl Rotator {
    pub fn new(config: RotatorConfig, handoff: mpsc::UnboundedSender<CompletedCapture>) -> Self {
        let (status, _) = watch::channel(RotatorStatus::default());
        Self {
            config,
            current: None,
            last_closed: None,
            handoff,
            status,
            files_completed: 0,
            packets_written: 0,
            bytes_written: 0,
        }
    }

    pub fn status_receiver(&self) -> watch::Receiver<RotatorStatus> {
        self.status.subscribe()
    }

    pub fn current_window(&self) -> Option<&TimeWindow> {
        self.current.as_ref().map(|c| &c.window)
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|c| c.writer.path())
    }

    /// Applies the retention horizon now. Failures are logged only.
    pub fn run_retention(&self, now: DateTime<Utc>) {
        let today = self.config.zone.today(now);
        if let Err(e) = retention::apply(&self.config.root, today, self.config.retention_days) {
            warn!("[{}] Retention pass failed: {}", self.config.interface, e);
        }
    }

    fn target_window(&self, frame_window: TimeWindow) -> TimeWindow {
        let mut target = frame_window;
        if let Some(closed) = &self.last_closed {
            if target <= *closed {
                target = closed.next();
            }
        }
        if let Some(open) = &self.current {
            if target < open.window {
                target = open.window.clone();
            }
        }
        target
    }

    fn open(&mut self, window: TimeWindow) -> Result<(), PersistenceError> {
        let root = &self.config.root;
        let mut path = window.capture_path(root);
        let mut n = 0;
        let writer = loop {
            match CaptureWriter::create(&path, self.config.snaplen, self.config.link_type) {
                Ok(writer) => break writer,
                Err(PersistenceError::Create { source, .. })
                    if source.kind() == ErrorKind::AlreadyExists && n < MAX_SIBLINGS =>
                {
                    n += 1;
                    path = window.numbered_capture_path(root, n);
                }
                Err(e) => return Err(e),
            }
        };
        info!(
            "[{}] Writing window {} to {}",
            self.config.interface,
            window.label(),
            path.display()
        );
        self.current = Some(OpenCapture { window, writer });
        self.publish();
        Ok(())
    }

    fn close_current(&mut self) -> Result<(), PersistenceError> {
        let mut open = match self.current.take() {
            Some(open) => open,
            None => return Ok(()),
        };
        self.last_closed = Some(open.window.clone());
        let result = open.writer.close();
        if let Err(e) = result {
            self.publish();
            return Err(e);
        }

        self.files_completed += 1;
        let completed = CompletedCapture {
            path: open.writer.path().to_path_buf(),
            window: open.window,
            packets: open.writer.packets(),
            bytes: open.writer.bytes(),
        };
        info!(
            "[{}] Closed {} ({} packets)",
            self.config.interface,
            completed.path.display(),
            completed.packets
        );
        if self.handoff.send(completed).is_err() {
            warn!(
                "[{}] Module runner is gone, completed file not queued for analysis",
                self.config.interface
            );
        }
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        let zone = self.config.zone;
        let status = RotatorStatus {
            current_file: self.current.as_ref().map(|c| c.writer.path().to_path_buf()),
            current_window: self.current.as_ref().map(|c| c.window.clone()),
            next_rotation: self.current.as_ref().and_then(|c| c.window.end(zone)),
            files_completed: self.files_completed,
            packets_written: self.packets_written,
            bytes_written: self.bytes_written,
        };
        self.status.send_replace(status);
    }
}

impl FrameSink for Rotator {
    fn write_frame(&mut self, frame: &RawFrame) -> Result<(), PersistenceError> {
        let frame_window =
            TimeWindow::from_timestamp(&self.config.interface, frame.timestamp(), self.config.zone);
        let target = self.target_window(frame_window);

        let needs_rotation = match &self.current {
            Some(open) => open.window != target,
            None => true,
        };
        if needs_rotation {
            let rotated = self.current.is_some();
            self.close_current()?;
            self.open(target)?;
            if rotated {
                self.run_retention(frame.timestamp());
            }
        }

        let open = match self.current.as_mut() {
            Some(open) => open,
            None => return Err(PersistenceError::Closed(self.config.root.clone())),
        };
        let before = open.writer.bytes();
        open.writer.write(frame)?;
        self.packets_written += 1;
        self.bytes_written += open.writer.bytes() - before;
        Ok(())
    }

    fn tick(&mut self, now: DateTime<Utc>) -> Result<(), PersistenceError> {
        let now_window = TimeWindow::from_timestamp(&self.config.interface, now, self.config.zone);
        let expired = match &self.current {
            Some(open) => now_window > open.window,
            None => false,
        };
        if expired {
            self.close_current()?;
            self.run_retention(now);
        } else if let Some(open) = self.current.as_mut() {
            open.writer.flush()?;
            self.publish();
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PersistenceError> {
        match self.current.as_mut() {
            Some(open) => open.writer.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), PersistenceError> {
        let result = self.close_current();
        if let Err(e) = &result {
            error!("[{}] Final capture file not finalized: {}", self.config.interface, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn config(root: &Path) -> RotatorConfig {
        RotatorConfig {
            root: root.to_path_buf(),
            interface: "eth0".to_string(),
            snaplen: 1518,
            link_type: LinkType::Ethernet,
            retention_days: 0,
            zone: WindowZone::Utc,
        }
    }

    fn at(h: u32, m: u32) -> RawFrame {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap().timestamp();
        RawFrame::new(ts, 0, 60, vec![0u8; 60])
    }

    #[test]
    fn hour_boundary_rotates_and_hands_off_once() {
        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut rotator = Rotator::new(config(tmp.path()), tx);

        rotator.write_frame(&at(13, 58)).unwrap();
        rotator.write_frame(&at(13, 59)).unwrap();
        rotator.write_frame(&at(14, 0)).unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.window.label(), "2024-05-01_13");
        assert_eq!(first.packets, 2);
        assert!(first.path.ends_with("raw/2024-05-01/eth0_2024-05-01_13.pcap"));
        assert!(rx.try_recv().is_err());
        assert_eq!(rotator.current_window().unwrap().hour, 14);

        rotator.close().unwrap();
        let last = rx.try_recv().unwrap();
        assert_eq!(last.window.hour, 14);
        assert_eq!(last.packets, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn late_frame_never_reopens_closed_window() {
        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut rotator = Rotator::new(config(tmp.path()), tx);

        rotator.write_frame(&at(13, 59)).unwrap();
        rotator.write_frame(&at(14, 1)).unwrap();
        rotator.write_frame(&at(13, 59)).unwrap();
        assert_eq!(rotator.current_window().unwrap().hour, 14);
        rotator.close().unwrap();

        let windows: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|c| (c.window.hour, c.packets))
            .collect();
        assert_eq!(windows, vec![(13, 1), (14, 2)]);
    }

    #[test]
    fn tick_closes_idle_window() {
        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut rotator = Rotator::new(config(tmp.path()), tx);
        rotator.write_frame(&at(9, 30)).unwrap();

        rotator.tick(Utc.with_ymd_and_hms(2024, 5, 1, 9, 45, 0).unwrap()).unwrap();
        assert!(rx.try_recv().is_err());

        rotator.tick(Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 5).unwrap()).unwrap();
        assert_eq!(rx.try_recv().unwrap().window.hour, 9);
        assert!(rotator.current_window().is_none());

        rotator.close().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn restart_in_same_hour_uses_numbered_sibling() {
        let tmp = TempDir::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut first = Rotator::new(config(tmp.path()), tx.clone());
        first.write_frame(&at(8, 0)).unwrap();
        first.close().unwrap();

        let mut second = Rotator::new(config(tmp.path()), tx);
        second.write_frame(&at(8, 5)).unwrap();
        second.close().unwrap();

        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert_eq!(a.window, b.window);
        assert!(b.path.ends_with("eth0_2024-05-01_08.1.pcap"));
    }

    #[test]
    fn status_tracks_current_file() {
        let tmp = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut rotator = Rotator::new(config(tmp.path()), tx);
        let status = rotator.status_receiver();
        rotator.write_frame(&at(5, 0)).unwrap();
        rotator.tick(Utc.with_ymd_and_hms(2024, 5, 1, 5, 1, 0).unwrap()).unwrap();
        let snap = status.borrow().clone();
        assert_eq!(snap.packets_written, 1);
        assert_eq!(snap.current_window.unwrap().hour, 5);
        assert_eq!(
            snap.next_rotation,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap())
        );
    }
}
