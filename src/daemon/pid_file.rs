use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error_handling::types::DaemonError;

/// Whether `pid` names a live process. A process we may not signal still exists.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Reads the PID stored in `path`; `Ok(None)` when there is no marker.
pub fn read_pid(path: &Path) -> Result<Option<i32>, DaemonError> {
    match fs::read_to_string(path) {
        Ok(contents) => contents
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map(Some)
            .ok_or_else(|| DaemonError::InvalidPid(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// PID marker owned by the running pipeline; removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: i32,
}

impl PidFile {
    /// Writes the current process id to `path`.
    ///
    /// Fails with `AlreadyRunning` when the marker belongs to a live process.
    /// A stale or unreadable marker is replaced.
    pub fn create(path: &Path) -> Result<Self, DaemonError> {
        Self::create_for(path, std::process::id() as i32)
    }

    pub(crate) fn create_for(path: &Path, pid: i32) -> Result<Self, DaemonError> {
        match read_pid(path) {
            Ok(Some(existing)) if existing != pid && process_alive(existing) => {
                return Err(DaemonError::AlreadyRunning(existing));
            }
            Ok(Some(existing)) => {
                warn!("Replacing stale PID file {} (PID {})", path.display(), existing);
                fs::remove_file(path)?;
            }
            Ok(None) => {}
            Err(DaemonError::InvalidPid(_)) => {
                warn!("Replacing unreadable PID file {}", path.display());
                fs::remove_file(path)?;
            }
            Err(e) => return Err(e),
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", pid)?;
        file.sync_all()?;
        info!("PID file {} written (PID {})", path.display(), pid);
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Only remove a marker that still names us.
        if let Ok(Some(pid)) = read_pid(&self.path) {
            if pid == self.pid {
                if let Err(e) = fs::remove_file(&self.path) {
                    warn!("Could not remove PID file {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    // Far above the default pid_max, never a live process.
    const DEAD_PID: i32 = 999_999_999;

    #[test]
    #[serial]
    fn marker_written_and_removed_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("run/sniff.pid");
        {
            let marker = PidFile::create(&path).unwrap();
            assert_eq!(read_pid(&path).unwrap(), Some(marker.pid()));
        }
        assert!(!path.exists());
    }

    #[test]
    #[serial]
    fn live_owner_blocks_second_instance() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sniff.pid");
        let me = std::process::id() as i32;
        fs::write(&path, format!("{}\n", me)).unwrap();

        let err = PidFile::create_for(&path, me + 1).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning(pid) if pid == me));
        assert!(path.exists());
    }

    #[test]
    #[serial]
    fn stale_marker_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sniff.pid");
        fs::write(&path, format!("{}\n", DEAD_PID)).unwrap();

        let marker = PidFile::create(&path).unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(marker.pid()));
    }

    #[test]
    fn garbage_marker_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sniff.pid");
        fs::write(&path, "not a pid").unwrap();
        assert!(matches!(read_pid(&path), Err(DaemonError::InvalidPid(_))));
        assert!(!process_alive(DEAD_PID));
        assert!(process_alive(std::process::id() as i32));
    }
}
