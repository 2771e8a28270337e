use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::decoder::{DecodedPacket, PacketSummary};

/// Bounded cache of the most recent packet summaries.
#[derive(Clone)]
pub struct LiveFeed {
    cache: Arc<Mutex<VecDeque<PacketSummary>>>,
    capacity: usize,
}

impl LiveFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            cache: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, summary: PacketSummary) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if cache.len() == self.capacity {
            cache.pop_front();
        }
        cache.push_back(summary);
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `limit` newest summaries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<PacketSummary> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        let skip = cache.len().saturating_sub(limit);
        cache.iter().skip(skip).cloned().collect()
    }

    /// Fills the cache from the engine's packet broadcast until it closes.
    /// A lagging feed skips packets; the pipeline never waits for it.
    pub fn spawn(&self, mut packets: broadcast::Receiver<Arc<DecodedPacket>>) -> JoinHandle<()> {
        let feed = self.clone();
        tokio::spawn(async move {
            loop {
                match packets.recv().await {
                    Ok(packet) => feed.push(PacketSummary::from(packet.as_ref())),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Live feed lagged, skipped {} packets", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Live feed closed");
        })
    }
}
