//! Storage subsystem
//!
//! Persists captured frames as hourly capture files and manages their lifetime.
//!
//! Components:
//! - `storage_trait`: the `FrameSink` trait the capture consumer writes through.
//! - `pcap_format`: global and per-record header layout.
//! - `capture_writer`: append-only writer for a single file.
//! - `time_window`: hourly buckets and the on-disk layout derived from them.
//! - `rotator`: owns the open file, rotates on hour boundaries, hands off closed files.
//! - `retention`: deletes dated directories past the retention horizon.
//! - `reader` and `catalog`: read back and enumerate stored captures.

pub mod capture_writer;
pub mod catalog;
pub mod pcap_format;
pub mod reader;
pub mod retention;
pub mod rotator;
pub mod storage_trait;
pub mod time_window;

pub use capture_writer::CaptureWriter;
pub use rotator::{CompletedCapture, Rotator, RotatorConfig, RotatorStatus};
pub use storage_trait::FrameSink;
pub use time_window::{TimeWindow, WindowZone};
