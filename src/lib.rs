//! Network traffic capture pipeline: live capture, protocol decoding, hourly
//! capture files with retention, and pluggable analysis of completed files.

pub mod analysis;
pub mod configuration;
pub mod controller;
pub mod daemon;
pub mod data_capture;
pub mod decoder;
pub mod error_handling;
pub mod storage;
pub mod web_interface;

pub use configuration::Config;
pub use controller::{Controller, RunSummary};
pub use error_handling::types::ControllerError;
