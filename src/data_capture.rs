//! Capture engine: wire reader, bounded frame queue, decode-and-persist consumer
//! and statistics.

pub mod consumer;
pub mod engine;
pub mod interfaces;
pub mod queue;
pub mod source;
pub mod stats;
pub mod types;

pub use consumer::{Consumer, ConsumerReport};
pub use engine::CaptureEngine;
pub use queue::{FrameQueue, Offer};
pub use source::{FrameSource, NextFrame, SyntheticSource};
pub use stats::{CaptureCounters, StatsSnapshot};
pub use types::{BufferProfile, CaptureSession, CaptureSettings, EngineState};
