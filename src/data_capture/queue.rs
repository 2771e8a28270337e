use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::decoder::types::RawFrame;

use super::stats::CaptureCounters;

/// What happened to a frame handed to [`FrameQueue::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queue full; counted as a drop.
    Dropped,
    /// Engine paused; discarded and not counted.
    Paused,
    /// Consumer is gone; not counted.
    Closed,
}

/// Non-blocking ingress side of the bounded frame queue.
///
/// The wire reader never waits on the consumer: a full queue drops the frame
/// and bumps the drop counter.
#[derive(Clone)]
pub struct FrameQueue {
    tx: mpsc::Sender<RawFrame>,
    counters: Arc<CaptureCounters>,
    paused: Arc<AtomicBool>,
    snaplen: u32,
}

impl FrameQueue {
    pub fn bounded(
        capacity: usize,
        snaplen: u32,
        counters: Arc<CaptureCounters>,
        paused: Arc<AtomicBool>,
    ) -> (Self, mpsc::Receiver<RawFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = Self {
            tx,
            counters,
            paused,
            snaplen,
        };
        (queue, rx)
    }

    pub fn offer(&self, frame: RawFrame) -> Offer {
        if self.paused.load(Ordering::Acquire) {
            return Offer::Paused;
        }
        let frame = frame.limit(self.snaplen);
        let wire_len = frame.orig_len();
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.counters.record_seen(wire_len);
                Offer::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.record_seen(wire_len);
                self.counters.record_drop();
                Offer::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Frames currently waiting for the consumer.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8) -> RawFrame {
        RawFrame::new(n as i64, 0, 60, vec![n; 60])
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let counters = Arc::new(CaptureCounters::default());
        let paused = Arc::new(AtomicBool::new(false));
        let (queue, _rx) = FrameQueue::bounded(2, 1518, counters.clone(), paused);

        let outcomes: Vec<_> = (0..5).map(|n| queue.offer(frame(n))).collect();
        assert_eq!(
            outcomes,
            vec![Offer::Queued, Offer::Queued, Offer::Dropped, Offer::Dropped, Offer::Dropped]
        );
        assert_eq!(counters.queue_drops(), 3);
        assert_eq!(counters.seen(), 5);
        assert_eq!(queue.depth(), 2);
    }

    #[test]
    fn paused_queue_discards_without_counting() {
        let counters = Arc::new(CaptureCounters::default());
        let paused = Arc::new(AtomicBool::new(true));
        let (queue, mut rx) = FrameQueue::bounded(4, 1518, counters.clone(), paused.clone());
        assert_eq!(queue.offer(frame(1)), Offer::Paused);
        assert_eq!(counters.seen(), 0);

        paused.store(false, Ordering::Release);
        assert_eq!(queue.offer(frame(2)), Offer::Queued);
        assert_eq!(rx.try_recv().unwrap().data()[0], 2);
    }

    #[test]
    fn closed_queue_leaves_counters_balanced() {
        let counters = Arc::new(CaptureCounters::default());
        let (queue, mut rx) =
            FrameQueue::bounded(4, 1518, counters.clone(), Arc::new(AtomicBool::new(false)));
        assert_eq!(queue.offer(frame(1)), Offer::Queued);
        rx.close();
        assert!(rx.try_recv().is_ok());
        counters.record_decoded(false);

        assert_eq!(queue.offer(frame(2)), Offer::Closed);
        assert_eq!(counters.seen(), 1);
        assert_eq!(counters.queue_drops(), 0);
        assert_eq!(counters.queue_depth(), 0);
    }

    #[test]
    fn offered_frames_respect_snaplen() {
        let counters = Arc::new(CaptureCounters::default());
        let (queue, mut rx) =
            FrameQueue::bounded(1, 64, counters, Arc::new(AtomicBool::new(false)));
        queue.offer(RawFrame::new(0, 0, 1500, vec![0u8; 1500]));
        let got = rx.try_recv().unwrap();
        assert_eq!(got.cap_len(), 64);
        assert_eq!(got.orig_len(), 1500);
    }
}
