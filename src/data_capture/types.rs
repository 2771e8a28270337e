//! Common data types used across the data_capture subsystem.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of the capture engine. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Memory class of a capture: kernel ring size and frame queue capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferProfile {
    Low,
    #[default]
    Balanced,
    Fast,
    Max,
}

impl BufferProfile {
    /// Kernel capture buffer in bytes.
    pub fn kernel_buffer(&self) -> usize {
        const MIB: usize = 1024 * 1024;
        match self {
            BufferProfile::Low => MIB,
            BufferProfile::Balanced => 2 * MIB,
            BufferProfile::Fast => 4 * MIB,
            BufferProfile::Max => 8 * MIB,
        }
    }

    /// Frames buffered between the wire reader and the decoder.
    pub fn queue_capacity(&self) -> usize {
        match self {
            BufferProfile::Low => 5_000,
            BufferProfile::Balanced => 10_000,
            BufferProfile::Fast => 20_000,
            BufferProfile::Max => 50_000,
        }
    }
}

/// Everything `start` needs to open an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureSettings {
    pub interface: String,
    pub filter: Option<String>,
    pub snaplen: u32,
    pub promiscuous: bool,
    pub profile: BufferProfile,
    /// Overrides the profile's queue capacity when set.
    pub queue_capacity: Option<usize>,
    #[serde(skip)]
    pub stats_interval: Duration,
}

impl CaptureSettings {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            filter: None,
            snaplen: 1518,
            promiscuous: true,
            profile: BufferProfile::default(),
            queue_capacity: None,
            stats_interval: Duration::from_secs(2),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| self.profile.queue_capacity())
            .max(1)
    }
}

/// Identity of one start..stop run of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSession {
    pub id: Uuid,
    pub settings: CaptureSettings,
    pub started_at: DateTime<Utc>,
}

impl CaptureSession {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            settings,
            started_at: Utc::now(),
        }
    }
}
