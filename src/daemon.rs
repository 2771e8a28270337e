//! Background-process control surface: PID marker, status and stop signal.

pub mod pid_file;

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use daemonize::{Daemonize, Outcome, Stdio};
use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;

use crate::error_handling::types::DaemonError;

pub use pid_file::{process_alive, read_pid, PidFile};

const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "pid", rename_all = "lowercase")]
pub enum DaemonStatus {
    Running(i32),
    Stopped,
    /// Marker present but its process is gone.
    Stale(i32),
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonStatus::Running(pid) => write!(f, "running (PID {})", pid),
            DaemonStatus::Stopped => write!(f, "stopped"),
            DaemonStatus::Stale(pid) => write!(f, "stopped (stale PID file for {})", pid),
        }
    }
}

pub fn daemon_status(pid_file: &Path) -> Result<DaemonStatus, DaemonError> {
    Ok(match read_pid(pid_file)? {
        None => DaemonStatus::Stopped,
        Some(pid) if process_alive(pid) => DaemonStatus::Running(pid),
        Some(pid) => DaemonStatus::Stale(pid),
    })
}

/// Sends SIGTERM to the marker's process, waits up to `grace` for it to exit,
/// then sends SIGKILL. The marker is removed once the process is gone.
pub async fn stop_daemon(pid_file: &Path, grace: Duration) -> Result<DaemonStatus, DaemonError> {
    let pid = match daemon_status(pid_file)? {
        DaemonStatus::Stopped => {
            info!("Daemon is not running");
            return Ok(DaemonStatus::Stopped);
        }
        DaemonStatus::Stale(pid) => {
            warn!("Removing stale PID file for {}", pid);
            remove_marker(pid_file);
            return Ok(DaemonStatus::Stopped);
        }
        DaemonStatus::Running(pid) => pid,
    };

    info!("Sending SIGTERM to daemon (PID {})", pid);
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        if process_alive(pid) {
            return Err(e.into());
        }
    }
    if !wait_for_exit(pid, grace).await {
        warn!("Daemon (PID {}) still alive after {:?}, sending SIGKILL", pid, grace);
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        if !wait_for_exit(pid, grace.max(Duration::from_secs(1))).await {
            return Ok(DaemonStatus::Running(pid));
        }
    }
    remove_marker(pid_file);
    info!("Daemon (PID {}) stopped", pid);
    Ok(DaemonStatus::Stopped)
}

async fn wait_for_exit(pid: i32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while process_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL).await;
    }
    true
}

fn remove_marker(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove PID file {}: {}", path.display(), e);
        }
    }
}

/// Detaches from the controlling terminal: new session, working directory `/`,
/// standard streams on `/dev/null`. Returns `true` in the background process
/// and `false` in the parent, which should exit.
///
/// Must run before any async runtime or extra thread is started.
pub fn detach() -> Result<bool, DaemonError> {
    let daemon = Daemonize::new()
        .working_directory("/")
        .stdout(Stdio::devnull())
        .stderr(Stdio::devnull());
    match daemon.execute() {
        Outcome::Parent(Ok(_)) => {
            info!("Daemon started in background");
            Ok(false)
        }
        Outcome::Child(Ok(_)) => Ok(true),
        Outcome::Parent(Err(e)) | Outcome::Child(Err(e)) => Err(DaemonError::Detach(e.to_string())),
    }
}
