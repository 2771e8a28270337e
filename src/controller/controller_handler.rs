use std::fs;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};

use crate::analysis::registry::ModuleRegistry;
use crate::analysis::runner::{ModuleRunner, RunnerStatus};
use crate::configuration::config::Config;
use crate::daemon::PidFile;
use crate::data_capture::engine::CaptureEngine;
use crate::data_capture::interfaces::interface_exists;
use crate::data_capture::source::{self, FrameSource};
use crate::data_capture::stats::StatsSnapshot;
use crate::error_handling::types::*;
use crate::storage::rotator::{Rotator, RotatorStatus};
use crate::web_interface::{ControlCommand, FeedState, LiveFeed, WebServer};

const CONTROL_CAPACITY: usize = 16;
const FEED_SHUTDOWN: Duration = Duration::from_secs(5);

/// Final numbers of one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stats: StatsSnapshot,
    pub rotator: RotatorStatus,
    pub analysis: Option<RunnerStatus>,
}

/// Owns one capture pipeline from start to teardown: capture engine, rotator,
/// module runner and the optional live feed.
pub struct Controller {
    config: Config,
    registry: ModuleRegistry,
    tick_every: Option<Duration>,
}

impl Controller {
    /// Validates `config` against the built-in modules.
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        Self::with_registry(config, ModuleRegistry::with_builtins())
    }

    pub fn with_registry(config: Config, registry: ModuleRegistry) -> Result<Self, ControllerError> {
        config.validate(&registry)?;
        Ok(Self {
            config,
            registry,
            tick_every: None,
        })
    }

    /// How often the open capture file is flushed and checked for expiry.
    pub fn with_tick_interval(mut self, every: Duration) -> Self {
        self.tick_every = Some(every);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Captures from the configured interface until SIGINT/SIGTERM, a stop
    /// command, or a fatal error.
    pub async fn run(&self) -> Result<RunSummary, ControllerError> {
        let interface = &self.config.capture.interface;
        if !interface_exists(interface) {
            return Err(ConfigError::InterfaceNotFound(interface.clone()).into());
        }
        let source = source::open_live(&self.config.capture_settings())?;
        self.run_with_source(source, shutdown_signal()).await
    }

    /// `run` holding the PID marker for its whole lifetime.
    pub async fn run_daemon(&self) -> Result<RunSummary, ControllerError> {
        let _marker = PidFile::create(&self.config.daemon.pid_file)?;
        self.run().await
    }

    /// Runs the pipeline over `source` until `shutdown` resolves, the source
    /// ends, a stop command arrives, or persistence fails. Shutdown always
    /// finalizes the open capture file and waits for analysis to drain.
    pub async fn run_with_source<S>(
        &self,
        source: Box<dyn FrameSource>,
        shutdown: S,
    ) -> Result<RunSummary, ControllerError>
    where
        S: Future<Output = ()>,
    {
        let config = &self.config;
        let root = &config.storage.output_root;
        fs::create_dir_all(root).map_err(|e| {
            ConfigError::InvalidOutputPath(format!("{}: {}", root.display(), e))
        })?;
        info!("[{}] Writing captures under {}", config.capture.interface, root.display());

        let (handoff_tx, handoff_rx) = mpsc::unbounded_channel();
        let rotator = Rotator::new(config.rotator_config(source.link_type()), handoff_tx);
        let rotator_status = rotator.status_receiver();
        rotator.run_retention(Utc::now());

        let (runner, runner_task) = if config.analysis.enabled {
            let runner = Arc::new(ModuleRunner::new(config.runner_config(), &self.registry)?);
            let task = runner.clone().spawn(handoff_rx);
            (Some(runner), Some(task))
        } else {
            info!("Analysis disabled, completed files are only stored");
            drop(handoff_rx);
            (None, None)
        };

        let mut engine = CaptureEngine::new(config.capture_settings());
        if let Some(every) = self.tick_every {
            engine = engine.with_tick_interval(every);
        }
        let finished = engine.finished();

        let (control_tx, mut control_rx) = mpsc::channel::<ControlCommand>(CONTROL_CAPACITY);
        let mut feed_stop: Option<oneshot::Sender<()>> = None;
        let mut feed_task = None;
        if config.live_feed.enabled {
            let addr = config.live_feed.socket_addr().ok_or_else(|| {
                ConfigError::NotInRange(format!("bind address {}", config.live_feed.bind_address))
            })?;
            let feed = LiveFeed::new(config.live_feed.cache_size);
            feed.spawn(engine.subscribe());
            let state = FeedState {
                interface: config.capture.interface.clone(),
                stats: engine.stats(),
                engine: engine.state_receiver(),
                rotator: rotator_status.clone(),
                runner: runner.clone(),
                feed,
                control: control_tx.clone(),
            };
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let (_, task) = WebServer::new(state)
                .start(addr, async move {
                    let _ = stop_rx.await;
                })
                .await?;
            feed_stop = Some(stop_tx);
            feed_task = Some(task);
        }

        if let Err(e) = engine.start(source, Box::new(rotator)) {
            error!("[{}] Capture failed to start: {}", config.capture.interface, e);
            return Err(e.into());
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = finished.notified() => {
                    info!("[{}] Capture ended", config.capture.interface);
                    break;
                }
                Some(command) = control_rx.recv() => {
                    let result = match command {
                        ControlCommand::Pause => engine.pause(),
                        ControlCommand::Resume => engine.resume(),
                        ControlCommand::Stop => {
                            info!("Stop requested by live feed consumer");
                            break;
                        }
                    };
                    if let Err(e) = result {
                        warn!("Control command {} rejected: {}", command.as_str(), e);
                    }
                }
            }
        }
        drop(control_tx);

        let stopped = engine.stop().await;
        let stats = engine.stats().borrow().clone();
        // The consumer owned the rotator; once it is gone the handoff channel
        // closes and the runner finishes whatever is queued.
        drop(engine);

        if let Some(stop) = feed_stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = feed_task.take() {
            if tokio::time::timeout(FEED_SHUTDOWN, task).await.is_err() {
                warn!("Live feed did not shut down within {:?}", FEED_SHUTDOWN);
            }
        }

        if let Some(task) = runner_task {
            debug!("Waiting for analysis to drain");
            if let Err(e) = task.await {
                error!("Module runner task failed: {}", e);
            }
        }

        let summary = RunSummary {
            stats,
            rotator: rotator_status.borrow().clone(),
            analysis: runner.as_ref().map(|r| r.status()),
        };
        info!(
            "Pipeline finished: {} captured, {} written, {} queue drops, {} files",
            summary.stats.packets_seen,
            summary.stats.packets_written,
            summary.stats.queue_drops,
            summary.rotator.files_completed
        );
        stopped?;
        Ok(summary)
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = term.recv() => info!("SIGTERM received"),
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}
