use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("TOML parsing error: {0}")]
    TomlError(String),
    #[error("Invalid interface name: {0}")]
    InvalidInterface(String),
    #[error("Interface does not exist: {0}")]
    InterfaceNotFound(String),
    #[error("Invalid filter expression `{filter}`: {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("Invalid output path: {0}")]
    InvalidOutputPath(String),
    #[error("Unknown analysis module: {0}")]
    UnknownModule(String),
    #[error("Value out of range: {0}")]
    NotInRange(String),
}

/// Reason a single layer could not be decoded.
///
/// Never fatal: the decoder keeps every layer parsed before the failing one and
/// stores this value on the packet.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize)]
pub enum DecodeIssue {
    #[error("{layer} truncated: need {needed} bytes, have {available}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("{layer} header invalid: {reason}")]
    InvalidHeader { layer: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Cannot create capture file {path:?}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("Write to {path:?} failed: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("Flush of {path:?} failed: {source}")]
    Flush { path: PathBuf, source: io::Error },
    #[error("Capture file {0:?} is closed")]
    Closed(PathBuf),
    #[error("Capture file {0:?} failed earlier and no longer accepts frames")]
    Poisoned(PathBuf),
    #[error("Cannot read capture file {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },
}

impl PersistenceError {
    pub fn path(&self) -> &PathBuf {
        match self {
            PersistenceError::Create { path, .. }
            | PersistenceError::Write { path, .. }
            | PersistenceError::Flush { path, .. } => path,
            PersistenceError::Closed(path) | PersistenceError::Poisoned(path) => path,
            PersistenceError::Read { path, .. } => path,
        }
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Insufficient privileges to open {interface}: {reason}")]
    PermissionDenied { interface: String, reason: String },
    #[error("Capture device error: {0}")]
    Device(String),
    #[error("Cannot {operation} while capture is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Capture worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Analysis failed: {0}")]
    Failed(String),
    #[error("Cannot read capture file {path:?}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("Output IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Output serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Module {module} timed out after {secs}s")]
    Timeout { module: String, secs: u64 },
    #[error("Module {0} panicked")]
    Panicked(String),
    #[error("Run was cancelled")]
    Cancelled,
}

impl From<PersistenceError> for ModuleError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Read { path, reason } => ModuleError::Read { path, reason },
            other => ModuleError::Read {
                path: other.path().clone(),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("Cannot scan {path:?}: {source}")]
    Scan { path: PathBuf, source: io::Error },
    #[error("Cannot remove {path:?}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Daemon already running with PID {0}")]
    AlreadyRunning(i32),
    #[error("PID file IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("PID file {0:?} does not contain a valid PID")]
    InvalidPid(PathBuf),
    #[error("Signal delivery failed: {0}")]
    Signal(#[from] nix::Error),
    #[error("Cannot detach from the terminal: {0}")]
    Detach(String),
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error("Cannot bind live feed on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),
    #[error("Live feed error: {0}")]
    Web(#[from] WebError),
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

impl ControllerError {
    /// Process exit status used by the binary for this fatal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ControllerError::Configuration(_) => 2,
            ControllerError::Capture(CaptureError::Configuration(_)) => 2,
            ControllerError::Capture(CaptureError::PermissionDenied { .. }) => 3,
            ControllerError::Capture(CaptureError::Persistence(_)) => 4,
            ControllerError::Daemon(_) => 5,
            _ => 1,
        }
    }
}
