use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::EngineState;

/// Counters shared by the reader thread and the consumer task.
///
/// Each counter has a single writer stage; readers only ever load.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    seen: AtomicU64,
    bytes: AtomicU64,
    queue_drops: AtomicU64,
    decoded: AtomicU64,
    decode_errors: AtomicU64,
    written: AtomicU64,
    kernel_drops: AtomicU64,
}

impl CaptureCounters {
    pub fn record_seen(&self, wire_len: u32) {
        self.seen.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self, decode_error: bool) {
        self.decoded.fetch_add(1, Ordering::Relaxed);
        if decode_error {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_written(&self) {
        self.written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_kernel_drops(&self, drops: u64) {
        self.kernel_drops.store(drops, Ordering::Relaxed);
    }

    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    pub fn queue_drops(&self) -> u64 {
        self.queue_drops.load(Ordering::Relaxed)
    }

    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Frames accepted into the queue and not yet decoded.
    pub fn queue_depth(&self) -> usize {
        self.seen()
            .saturating_sub(self.queue_drops())
            .saturating_sub(self.decoded()) as usize
    }
}

/// Read-only statistics published by the engine at a fixed interval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub state: EngineState,
    pub interface: String,
    pub packets_seen: u64,
    pub packets_decoded: u64,
    pub packets_written: u64,
    pub decode_errors: u64,
    pub queue_drops: u64,
    pub kernel_drops: u64,
    pub bytes: u64,
    pub packets_per_sec: f64,
    pub bits_per_sec: f64,
    pub uptime_secs: f64,
    pub queue_depth: usize,
    pub updated_at: DateTime<Utc>,
}

impl StatsSnapshot {
    pub fn idle(interface: &str) -> Self {
        Self {
            state: EngineState::Idle,
            interface: interface.to_string(),
            packets_seen: 0,
            packets_decoded: 0,
            packets_written: 0,
            decode_errors: 0,
            queue_drops: 0,
            kernel_drops: 0,
            bytes: 0,
            packets_per_sec: 0.0,
            bits_per_sec: 0.0,
            uptime_secs: 0.0,
            queue_depth: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Turns cumulative counters into per-second rates between two samples.
#[derive(Debug)]
pub struct RateTracker {
    started: Instant,
    last_at: Instant,
    last_packets: u64,
    last_bytes: u64,
}

impl RateTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            last_at: now,
            last_packets: 0,
            last_bytes: 0,
        }
    }

    pub fn snapshot(
        &mut self,
        counters: &CaptureCounters,
        state: EngineState,
        interface: &str,
        queue_depth: usize,
        now: Instant,
    ) -> StatsSnapshot {
        let packets = counters.seen();
        let bytes = counters.bytes.load(Ordering::Relaxed);
        let elapsed = now.duration_since(self.last_at).as_secs_f64();
        let (pps, bps) = if elapsed > 0.0 {
            (
                packets.saturating_sub(self.last_packets) as f64 / elapsed,
                bytes.saturating_sub(self.last_bytes) as f64 * 8.0 / elapsed,
            )
        } else {
            (0.0, 0.0)
        };
        self.last_at = now;
        self.last_packets = packets;
        self.last_bytes = bytes;

        StatsSnapshot {
            state,
            interface: interface.to_string(),
            packets_seen: packets,
            packets_decoded: counters.decoded(),
            packets_written: counters.written(),
            decode_errors: counters.decode_errors.load(Ordering::Relaxed),
            queue_drops: counters.queue_drops(),
            kernel_drops: counters.kernel_drops.load(Ordering::Relaxed),
            bytes,
            packets_per_sec: pps,
            bits_per_sec: bps,
            uptime_secs: now.duration_since(self.started).as_secs_f64(),
            queue_depth,
            updated_at: Utc::now(),
        }
    }
}
