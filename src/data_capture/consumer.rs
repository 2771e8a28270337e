use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, trace};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::decoder::types::{DecodedPacket, RawFrame};
use crate::decoder::Decoder;
use crate::error_handling::types::PersistenceError;
use crate::storage::storage_trait::FrameSink;

use super::stats::CaptureCounters;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    pub decoded: u64,
    pub written: u64,
}

/// Decode-and-persist stage: drains the frame queue, numbers and decodes each
/// frame, writes it through the sink and fans it out to live subscribers.
pub struct Consumer {
    interface: String,
    decoder: Decoder,
    sink: Box<dyn FrameSink>,
    counters: Arc<CaptureCounters>,
    live: Option<broadcast::Sender<Arc<DecodedPacket>>>,
    tick_every: Duration,
    shutdown: Option<Arc<Notify>>,
    report: ConsumerReport,
}

impl Consumer {
    pub fn new(
        interface: &str,
        decoder: Decoder,
        sink: Box<dyn FrameSink>,
        counters: Arc<CaptureCounters>,
    ) -> Self {
        Self {
            interface: interface.to_string(),
            decoder,
            sink,
            counters,
            live: None,
            tick_every: Duration::from_secs(1),
            shutdown: None,
            report: ConsumerReport::default(),
        }
    }

    pub fn with_live_feed(mut self, live: broadcast::Sender<Arc<DecodedPacket>>) -> Self {
        self.live = Some(live);
        self
    }

    /// How often the sink is ticked so idle windows get closed.
    pub fn with_tick_interval(mut self, every: Duration) -> Self {
        self.tick_every = every;
        self
    }

    /// Once notified, the consumer drains what is already queued, closes the
    /// sink and exits even if queue senders are still alive.
    pub fn with_shutdown(mut self, shutdown: Arc<Notify>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Handles one frame. Sequence numbers start at 1 and have no gaps.
    pub fn process(&mut self, frame: RawFrame) -> Result<(), PersistenceError> {
        let seq = self.report.decoded + 1;
        let packet = self.decoder.decode(seq, frame);
        self.report.decoded = seq;
        self.counters.record_decoded(packet.decode_error());
        trace!(
            "[{}] #{} {:?}{}",
            self.interface,
            seq,
            packet.layer_names(),
            if packet.decode_error() { " (decode error)" } else { "" }
        );

        self.sink.write_frame(packet.frame())?;
        self.report.written += 1;
        self.counters.record_written();

        if let Some(live) = &self.live {
            // No subscribers is fine.
            let _ = live.send(Arc::new(packet));
        }
        Ok(())
    }

    /// Runs until every sender of `rx` is gone and the queue is empty, or until
    /// the shutdown notification, then closes the sink. A persistence failure
    /// closes the queue so the reader stops, and is returned.
    pub async fn run(mut self, mut rx: mpsc::Receiver<RawFrame>) -> Result<ConsumerReport, PersistenceError> {
        let mut ticker = interval_at(Instant::now() + self.tick_every, self.tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let shutdown = self.shutdown.take();

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(frame) => {
                        if let Err(e) = self.process(frame) {
                            return Err(self.fail(&mut rx, e));
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.sink.tick(Utc::now()) {
                        return Err(self.fail(&mut rx, e));
                    }
                }
                _ = notified(shutdown.as_deref()) => {
                    debug!("[{}] Shutdown requested, draining queued frames", self.interface);
                    rx.close();
                    while let Ok(frame) = rx.try_recv() {
                        if let Err(e) = self.process(frame) {
                            return Err(self.fail(&mut rx, e));
                        }
                    }
                    break;
                }
            }
        }

        debug!(
            "[{}] Queue drained after {} packets, closing sink",
            self.interface, self.report.decoded
        );
        self.sink.close()?;
        Ok(self.report)
    }

    fn fail(&mut self, rx: &mut mpsc::Receiver<RawFrame>, err: PersistenceError) -> PersistenceError {
        error!(
            "[{}] Persistence failed, stopping capture: {}",
            self.interface, err
        );
        rx.close();
        if let Err(close_err) = self.sink.close() {
            debug!("[{}] Sink close after failure: {}", self.interface, close_err);
        }
        err
    }
}

async fn notified(shutdown: Option<&Notify>) {
    match shutdown {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}
