//! Storage Trait
//!
//! `FrameSink` is the interface the capture consumer persists frames through.
//! The rotator is the production implementation; tests plug in in-memory sinks.

use chrono::{DateTime, Utc};

use crate::decoder::types::RawFrame;
use crate::error_handling::types::PersistenceError;

pub trait FrameSink: Send {
    /// Persists one frame. An error is fatal for the current file.
    fn write_frame(&mut self, frame: &RawFrame) -> Result<(), PersistenceError>;

    /// Gives the sink a chance to close a window that ended without traffic.
    fn tick(&mut self, _now: DateTime<Utc>) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PersistenceError>;

    /// Finalizes whatever is open. Called once at stop.
    fn close(&mut self) -> Result<(), PersistenceError>;
}
