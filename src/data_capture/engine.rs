use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

use crate::decoder::types::DecodedPacket;
use crate::decoder::Decoder;
use crate::error_handling::types::{CaptureError, PersistenceError};
use crate::storage::storage_trait::FrameSink;

use super::consumer::{Consumer, ConsumerReport};
use super::queue::{FrameQueue, Offer};
use super::source::{self, FrameSource, NextFrame};
use super::stats::{CaptureCounters, RateTracker, StatsSnapshot};
use super::types::{CaptureSession, CaptureSettings, EngineState};

const KERNEL_DROP_POLL: Duration = Duration::from_secs(1);
const LIVE_FEED_CAPACITY: usize = 1024;

type ReaderHandle = thread::JoinHandle<Result<(), CaptureError>>;

/// Capture pipeline of one interface: a blocking wire reader thread feeding a
/// bounded queue, and an async consumer decoding and persisting.
///
/// State machine: `Idle -> Running <-> Paused -> Stopped`.
pub struct CaptureEngine {
    settings: CaptureSettings,
    session: Option<CaptureSession>,
    state: watch::Sender<EngineState>,
    counters: Arc<CaptureCounters>,
    paused: Arc<AtomicBool>,
    stop_flag: Arc<AtomicBool>,
    reader: Option<ReaderHandle>,
    consumer: Option<JoinHandle<Result<ConsumerReport, PersistenceError>>>,
    stats_task: Option<JoinHandle<()>>,
    stats: watch::Sender<StatsSnapshot>,
    live: broadcast::Sender<Arc<DecodedPacket>>,
    finished: Arc<Notify>,
    drain: Arc<Notify>,
    grace: Duration,
    tick_every: Duration,
}

impl CaptureEngine {
    pub fn new(settings: CaptureSettings) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        let (stats, _) = watch::channel(StatsSnapshot::idle(&settings.interface));
        let (live, _) = broadcast::channel(LIVE_FEED_CAPACITY);
        Self {
            settings,
            session: None,
            state,
            counters: Arc::new(CaptureCounters::default()),
            paused: Arc::new(AtomicBool::new(false)),
            stop_flag: Arc::new(AtomicBool::new(false)),
            reader: None,
            consumer: None,
            stats_task: None,
            stats,
            live,
            finished: Arc::new(Notify::new()),
            drain: Arc::new(Notify::new()),
            grace: Duration::from_secs(5),
            tick_every: Duration::from_secs(1),
        }
    }

    /// Bounded time `stop` waits for each stage before tearing it down.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_tick_interval(mut self, every: Duration) -> Self {
        self.tick_every = every;
        self
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn session(&self) -> Option<&CaptureSession> {
        self.session.as_ref()
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        self.counters.clone()
    }

    pub fn stats(&self) -> watch::Receiver<StatsSnapshot> {
        self.stats.subscribe()
    }

    /// Live feed of decoded packets. Slow subscribers lag and skip, they never
    /// hold the pipeline back.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DecodedPacket>> {
        self.live.subscribe()
    }

    /// Notified once the consumer has exited on its own (end of source or
    /// persistence failure) or after `stop`.
    pub fn finished(&self) -> Arc<Notify> {
        self.finished.clone()
    }

    /// Opens the configured live interface and starts capturing into `sink`.
    pub fn start_live(&mut self, sink: Box<dyn FrameSink>) -> Result<(), CaptureError> {
        self.ensure_idle("start")?;
        let source = source::open_live(&self.settings)?;
        self.start(source, sink)
    }

    /// Starts capturing from `source` into `sink`. Must run inside a tokio runtime.
    pub fn start(&mut self, source: Box<dyn FrameSource>, sink: Box<dyn FrameSink>) -> Result<(), CaptureError> {
        self.ensure_idle("start")?;

        let session = CaptureSession::new(self.settings.clone());
        let interface = self.settings.interface.clone();
        let decoder = Decoder::new(source.link_type());

        let (queue, rx) = FrameQueue::bounded(
            self.settings.queue_capacity(),
            self.settings.snaplen,
            self.counters.clone(),
            self.paused.clone(),
        );

        let consumer = Consumer::new(&interface, decoder, sink, self.counters.clone())
            .with_live_feed(self.live.clone())
            .with_tick_interval(self.tick_every)
            .with_shutdown(self.drain.clone());
        let finished = self.finished.clone();
        self.consumer = Some(tokio::spawn(async move {
            let result = consumer.run(rx).await;
            finished.notify_one();
            result
        }));

        let stop = self.stop_flag.clone();
        let counters = self.counters.clone();
        let reader_iface = interface.clone();
        let reader = thread::Builder::new()
            .name(format!("capture-{}", interface))
            .spawn(move || read_loop(source, queue, stop, counters, &reader_iface))
            .map_err(|e| CaptureError::Worker(e.to_string()))?;
        self.reader = Some(reader);

        self.stats_task = Some(tokio::spawn(publish_stats(
            interface.clone(),
            self.counters.clone(),
            self.state.subscribe(),
            self.stats.clone(),
            self.settings.stats_interval,
        )));

        info!(
            "[{}] Capture started (session {}, snaplen {}, queue {}, filter {:?})",
            interface,
            session.id,
            self.settings.snaplen,
            self.settings.queue_capacity(),
            self.settings.filter
        );
        self.session = Some(session);
        self.state.send_replace(EngineState::Running);
        Ok(())
    }

    /// Stops new frames from reaching decode and persist. No-op when already paused.
    pub fn pause(&mut self) -> Result<(), CaptureError> {
        match self.state() {
            EngineState::Paused => Ok(()),
            EngineState::Running => {
                self.paused.store(true, Ordering::Release);
                self.state.send_replace(EngineState::Paused);
                info!("[{}] Capture paused", self.settings.interface);
                Ok(())
            }
            other => Err(invalid("pause", other)),
        }
    }

    /// No-op when already running.
    pub fn resume(&mut self) -> Result<(), CaptureError> {
        match self.state() {
            EngineState::Running => Ok(()),
            EngineState::Paused => {
                self.paused.store(false, Ordering::Release);
                self.state.send_replace(EngineState::Running);
                info!("[{}] Capture resumed", self.settings.interface);
                Ok(())
            }
            other => Err(invalid("resume", other)),
        }
    }

    /// Flips between running and paused, returning whether the engine is now paused.
    pub fn toggle_pause(&mut self) -> Result<bool, CaptureError> {
        match self.state() {
            EngineState::Running => self.pause().map(|_| true),
            EngineState::Paused => self.resume().map(|_| false),
            other => Err(invalid("toggle pause", other)),
        }
    }

    /// Cooperative shutdown: stops the reader, drains the queue, closes the open
    /// capture file and releases the interface. Each stage gets the grace period
    /// before it is abandoned.
    pub async fn stop(&mut self) -> Result<ConsumerReport, CaptureError> {
        match self.state() {
            EngineState::Stopped => return Ok(ConsumerReport::default()),
            EngineState::Idle => {
                self.state.send_replace(EngineState::Stopped);
                return Ok(ConsumerReport::default());
            }
            EngineState::Running | EngineState::Paused => {}
        }
        let interface = self.settings.interface.clone();
        info!("[{}] Stopping capture", interface);
        self.stop_flag.store(true, Ordering::Release);

        let mut reader_result = Ok(());
        if let Some(reader) = self.reader.take() {
            let joined = tokio::task::spawn_blocking(move || reader.join());
            match tokio::time::timeout(self.grace, joined).await {
                Ok(Ok(Ok(result))) => reader_result = result,
                Ok(Ok(Err(_))) => reader_result = Err(CaptureError::Worker("capture reader panicked".into())),
                Ok(Err(e)) => reader_result = Err(CaptureError::Worker(e.to_string())),
                Err(_) => warn!("[{}] Capture reader did not exit within {:?}", interface, self.grace),
            }
        }
        // A reader stuck in its source still holds a queue sender.
        self.drain.notify_one();

        let mut report = ConsumerReport::default();
        let mut consumer_result = Ok(());
        if let Some(mut consumer) = self.consumer.take() {
            match tokio::time::timeout(self.grace, &mut consumer).await {
                Ok(Ok(Ok(r))) => report = r,
                Ok(Ok(Err(e))) => consumer_result = Err(CaptureError::Persistence(e)),
                Ok(Err(e)) => consumer_result = Err(CaptureError::Worker(e.to_string())),
                Err(_) => {
                    error!("[{}] Consumer did not drain within {:?}, aborting", interface, self.grace);
                    consumer.abort();
                    consumer_result = Err(CaptureError::Worker("consumer drain timed out".into()));
                }
            }
        }

        self.state.send_replace(EngineState::Stopped);
        if let Some(task) = self.stats_task.take() {
            // One last snapshot with the final counters and the stopped state.
            let mut tracker = RateTracker::new(Instant::now());
            let snapshot = tracker.snapshot(&self.counters, EngineState::Stopped, &interface, 0, Instant::now());
            task.abort();
            self.stats.send_replace(snapshot);
        }
        self.finished.notify_one();

        info!(
            "[{}] Capture stopped: {} seen, {} written, {} dropped",
            interface,
            self.counters.seen(),
            self.counters.written(),
            self.counters.queue_drops()
        );
        consumer_result?;
        reader_result?;
        Ok(report)
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<(), CaptureError> {
        match self.state() {
            EngineState::Idle => Ok(()),
            other => Err(invalid(operation, other)),
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(task) = self.stats_task.take() {
            task.abort();
        }
    }
}

fn invalid(operation: &'static str, state: EngineState) -> CaptureError {
    CaptureError::InvalidState {
        operation,
        state: state.to_string(),
    }
}

/// Wire reader. Never blocks on the consumer; exits on stop, end of source, or
/// when the consumer has gone away.
fn read_loop(
    mut source: Box<dyn FrameSource>,
    queue: FrameQueue,
    stop: Arc<AtomicBool>,
    counters: Arc<CaptureCounters>,
    interface: &str,
) -> Result<(), CaptureError> {
    let mut last_poll = Instant::now();
    let result = loop {
        if stop.load(Ordering::Acquire) {
            break Ok(());
        }
        match source.next_frame() {
            Ok(NextFrame::Frame(frame)) => {
                if queue.offer(frame) == Offer::Closed {
                    debug!("[{}] Frame queue closed, reader exiting", interface);
                    break Ok(());
                }
            }
            Ok(NextFrame::Timeout) => {}
            Ok(NextFrame::Eof) => {
                info!("[{}] Capture source exhausted", interface);
                break Ok(());
            }
            Err(e) => {
                error!("[{}] Capture source failed: {}", interface, e);
                break Err(e);
            }
        }
        if last_poll.elapsed() >= KERNEL_DROP_POLL {
            if let Some(drops) = source.kernel_drops() {
                counters.set_kernel_drops(drops);
            }
            last_poll = Instant::now();
        }
    };
    if let Some(drops) = source.kernel_drops() {
        counters.set_kernel_drops(drops);
    }
    result
}

async fn publish_stats(
    interface: String,
    counters: Arc<CaptureCounters>,
    mut state: watch::Receiver<EngineState>,
    stats: watch::Sender<StatsSnapshot>,
    every: Duration,
) {
    let mut tracker = RateTracker::new(Instant::now());
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let current = *state.borrow();
        let snapshot = tracker.snapshot(&counters, current, &interface, counters.queue_depth(), Instant::now());
        stats.send_replace(snapshot);
        if current == EngineState::Stopped {
            break;
        }
    }
}
