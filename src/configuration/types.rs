use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::data_capture::types::BufferProfile;
use crate::storage::time_window::WindowZone;

/// `[capture]`: what to listen on and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    /// Interface name, or `any` for every interface.
    pub interface: String,
    /// BPF filter expression; empty means no filter.
    pub filter: Option<String>,
    pub snaplen: u32,
    pub promiscuous: bool,
    pub buffer_profile: BufferProfile,
    /// Overrides the profile's queue capacity.
    pub queue_capacity: Option<usize>,
    pub stats_interval_secs: u64,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            interface: String::from("eth0"),
            filter: None,
            snaplen: 1518,
            promiscuous: true,
            buffer_profile: BufferProfile::Balanced,
            queue_capacity: None,
            stats_interval_secs: 2,
        }
    }
}

/// `[storage]`: where capture files go and how long they stay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub output_root: PathBuf,
    /// Days of raw captures to keep; 0 keeps everything.
    pub retention_days: u32,
    /// Clock used to cut hourly windows.
    pub time_zone: WindowZone,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("./captures"),
            retention_days: 7,
            time_zone: WindowZone::Local,
        }
    }
}

/// `[analysis]`: module runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSection {
    pub enabled: bool,
    /// Module names to run; absent runs every registered module.
    pub modules: Option<Vec<String>>,
    pub workers: usize,
    pub module_timeout_secs: u64,
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            enabled: true,
            modules: None,
            workers: 2,
            module_timeout_secs: 300,
        }
    }
}

/// `[daemon]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    pub pid_file: PathBuf,
    pub stop_grace_secs: u64,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            pid_file: PathBuf::from("/tmp/sniff.pid"),
            stop_grace_secs: 10,
        }
    }
}

/// `[live_feed]`: HTTP feed for external consumers. Off unless enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveFeedSection {
    pub enabled: bool,
    pub bind_address: String,
    pub cache_size: usize,
}

impl Default for LiveFeedSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_address: String::from("127.0.0.1:8080"),
            cache_size: 5000,
        }
    }
}

impl LiveFeedSection {
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.bind_address.parse().ok()
    }
}
