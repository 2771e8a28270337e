//! Error kinds shared by every subsystem.
//!
//! Fatal kinds (`ConfigError`, `CaptureError::PermissionDenied`, `PersistenceError`) stop a run;
//! `DecodeIssue`, `ModuleError` and `RetentionError` are recorded and logged only.

pub mod types;

pub use types::*;
