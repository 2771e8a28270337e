use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::analysis::module_trait::{AnalysisModule, ModuleSummary};
use crate::analysis::output::{write_summary, DetectionWriter};
use crate::analysis::registry::ModuleRegistry;
use crate::error_handling::types::{ConfigError, ModuleError};
use crate::storage::rotator::CompletedCapture;
use crate::storage::time_window::TimeWindow;

// Settlement of one run: whichever side moves it out of PENDING first wins.
const PENDING: u8 = 0;
const COMMITTED: u8 = 1;
const ABANDONED: u8 = 2;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub root: PathBuf,
    pub workers: usize,
    pub timeout: Duration,
    /// `None` runs every registered module.
    pub enabled: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded { detections: u64, packets: u64 },
    Failed { reason: String },
    TimedOut { after_secs: f64 },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded { .. })
    }
}

/// Result of one module against one window. Replaced on re-analysis.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeRecord {
    pub module: String,
    pub window: TimeWindow,
    pub capture_file: PathBuf,
    pub outcome: RunOutcome,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunnerStatus {
    pub queued: u64,
    pub running: u64,
    /// Worker slots still held by runs that already timed out.
    pub stalled: u64,
    pub completed: u64,
    pub failed: u64,
    pub enabled_modules: Vec<String>,
    pub available_modules: Vec<String>,
    pub outcomes: Vec<OutcomeRecord>,
}

/// Runs every enabled module against each completed capture file.
///
/// At most `workers` module runs execute at once, each on a blocking worker
/// and bounded by `timeout`. A failing, panicking or slow module only affects
/// its own (module, window) outcome.
pub struct ModuleRunner {
    root: PathBuf,
    timeout: Duration,
    modules: Vec<Arc<dyn AnalysisModule>>,
    available: Vec<String>,
    permits: Arc<Semaphore>,
    queued: AtomicU64,
    running: AtomicU64,
    stalled: Arc<AtomicU64>,
    completed: AtomicU64,
    failed: AtomicU64,
    outcomes: Mutex<BTreeMap<(String, TimeWindow), OutcomeRecord>>,
}

impl ModuleRunner {
    pub fn new(config: RunnerConfig, registry: &ModuleRegistry) -> Result<Self, ConfigError> {
        if config.workers == 0 {
            return Err(ConfigError::NotInRange("analysis workers must be at least 1".into()));
        }
        if config.timeout.is_zero() {
            return Err(ConfigError::NotInRange("module timeout must be positive".into()));
        }
        let modules = registry.resolve(config.enabled.as_deref())?;
        info!(
            "Module runner ready: {} worker(s), timeout {:?}, modules [{}]",
            config.workers,
            config.timeout,
            modules.iter().map(|m| m.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(Self {
            root: config.root,
            timeout: config.timeout,
            modules,
            available: registry.names(),
            permits: Arc::new(Semaphore::new(config.workers)),
            queued: AtomicU64::new(0),
            running: AtomicU64::new(0),
            stalled: Arc::new(AtomicU64::new(0)),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            outcomes: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Consumes the rotator handoff channel until it closes, then waits for
    /// every in-flight analysis to finish.
    pub fn spawn(self: Arc<Self>, mut handoff: mpsc::UnboundedReceiver<CompletedCapture>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut jobs = JoinSet::new();
            loop {
                tokio::select! {
                    next = handoff.recv() => match next {
                        Some(capture) => {
                            info!(
                                "[{}] Analysis queued for {}",
                                capture.window.interface,
                                capture.path.display()
                            );
                            let runner = self.clone();
                            jobs.spawn(async move {
                                runner.process(capture).await;
                            });
                        }
                        None => break,
                    },
                    Some(joined) = jobs.join_next(), if !jobs.is_empty() => {
                        if let Err(e) = joined {
                            error!("Analysis job aborted: {}", e);
                        }
                    }
                }
            }
            while let Some(joined) = jobs.join_next().await {
                if let Err(e) = joined {
                    error!("Analysis job aborted: {}", e);
                }
            }
            info!("Module runner drained");
        })
    }

    /// Runs all enabled modules against a handed-off capture.
    pub async fn process(self: &Arc<Self>, capture: CompletedCapture) -> Vec<OutcomeRecord> {
        self.analyze_now(&capture.path, &capture.window).await
    }

    /// Analyzes `capture` as `window` now, replacing earlier outputs for the
    /// same (module, window) keys.
    pub async fn analyze_now(self: &Arc<Self>, capture: &Path, window: &TimeWindow) -> Vec<OutcomeRecord> {
        let mut runs = JoinSet::new();
        for (idx, module) in self.modules.iter().enumerate() {
            let runner = self.clone();
            let module = module.clone();
            let capture = capture.to_path_buf();
            let window = window.clone();
            self.queued.fetch_add(1, Ordering::Relaxed);
            runs.spawn(async move { (idx, runner.run_module(module, capture, window).await) });
        }
        let mut records: Vec<(usize, OutcomeRecord)> = Vec::with_capacity(self.modules.len());
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(record) => records.push(record),
                Err(e) => error!("Module dispatch aborted: {}", e),
            }
        }
        records.sort_by_key(|(idx, _)| *idx);
        records.into_iter().map(|(_, r)| r).collect()
    }

    async fn run_module(
        &self,
        module: Arc<dyn AnalysisModule>,
        capture: PathBuf,
        window: TimeWindow,
    ) -> OutcomeRecord {
        let name = module.name().to_string();
        let permit = self.permits.clone().acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        let permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                return self.record(&name, &window, &capture, RunOutcome::Failed {
                    reason: "worker pool closed".into(),
                })
            }
        };

        let (summary_path, index_path) = window.module_output_paths(&self.root, &name);
        let output_dir = window.module_dir(&self.root, &name);
        let mut writer = match DetectionWriter::create(&index_path) {
            Ok(writer) => writer,
            Err(e) => {
                return self.record(&name, &window, &capture, RunOutcome::Failed {
                    reason: e.to_string(),
                })
            }
        };
        let cancel = writer.cancel_handle();
        let settle = Arc::new(AtomicU8::new(PENDING));

        self.running.fetch_add(1, Ordering::Relaxed);
        debug!("[module {}] Analyzing {}", name, capture.display());
        let started = std::time::Instant::now();
        let mut task = {
            let capture = capture.clone();
            let window = window.clone();
            let settle = settle.clone();
            tokio::task::spawn_blocking(move || {
                // The slot stays taken until the worker thread really returns.
                let _permit = permit;
                let summary = module.analyze(
                    &capture,
                    &output_dir,
                    &window.interface,
                    &window,
                    &mut writer,
                )?;
                persist(summary, writer, &summary_path, &settle)
            })
        };

        let outcome = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => self.settled(&name, &window, joined),
            Err(_) => {
                cancel.store(true, Ordering::Release);
                if settle
                    .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let err = ModuleError::Timeout {
                        module: name.clone(),
                        secs: self.timeout.as_secs(),
                    };
                    warn!("[module {}] {}: {}", name, window.label(), err);
                    self.release_when_done(&name, task);
                    RunOutcome::TimedOut {
                        after_secs: started.elapsed().as_secs_f64(),
                    }
                } else {
                    // Outputs were committed before the deadline was acted on.
                    let joined = task.await;
                    self.settled(&name, &window, joined)
                }
            }
        };
        self.running.fetch_sub(1, Ordering::Relaxed);
        self.record(&name, &window, &capture, outcome)
    }

    fn settled(
        &self,
        name: &str,
        window: &TimeWindow,
        joined: Result<Result<ModuleSummary, ModuleError>, JoinError>,
    ) -> RunOutcome {
        match joined {
            Ok(Ok(summary)) => {
                info!(
                    "[module {}] {} done: {} packets, {} detections in {:.2}s",
                    name,
                    window.label(),
                    summary.total_packets,
                    summary.total_detections,
                    summary.duration_secs
                );
                RunOutcome::Succeeded {
                    detections: summary.total_detections,
                    packets: summary.total_packets,
                }
            }
            Ok(Err(e)) => {
                warn!("[module {}] {} failed: {}", name, window.label(), e);
                RunOutcome::Failed { reason: e.to_string() }
            }
            Err(join) => {
                let err = if join.is_panic() {
                    ModuleError::Panicked(name.to_string())
                } else {
                    ModuleError::Failed(join.to_string())
                };
                error!("[module {}] {} aborted: {}", name, window.label(), err);
                RunOutcome::Failed { reason: err.to_string() }
            }
        }
    }

    /// A timed-out worker cannot be killed; its slot is counted as stalled
    /// until the thread returns.
    fn release_when_done(&self, name: &str, task: JoinHandle<Result<ModuleSummary, ModuleError>>) {
        let stalled = self.stalled.clone();
        let held = stalled.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "[module {}] Worker slot stays held until the module returns ({} stalled)",
            name, held
        );
        let name = name.to_string();
        tokio::spawn(async move {
            let _ = task.await;
            stalled.fetch_sub(1, Ordering::Relaxed);
            info!("[module {}] Timed-out worker returned, slot released", name);
        });
    }

    fn record(&self, module: &str, window: &TimeWindow, capture: &Path, outcome: RunOutcome) -> OutcomeRecord {
        if outcome.is_success() {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let record = OutcomeRecord {
            module: module.to_string(),
            window: window.clone(),
            capture_file: capture.to_path_buf(),
            outcome,
            finished_at: Utc::now(),
        };
        let mut outcomes = self.outcomes.lock().unwrap_or_else(|p| p.into_inner());
        outcomes.insert((module.to_string(), window.clone()), record.clone());
        record
    }

    pub fn outcome(&self, module: &str, window: &TimeWindow) -> Option<OutcomeRecord> {
        let outcomes = self.outcomes.lock().unwrap_or_else(|p| p.into_inner());
        outcomes.get(&(module.to_string(), window.clone())).cloned()
    }

    pub fn status(&self) -> RunnerStatus {
        let outcomes = self.outcomes.lock().unwrap_or_else(|p| p.into_inner());
        RunnerStatus {
            queued: self.queued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            stalled: self.stalled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            enabled_modules: self.modules.iter().map(|m| m.name().to_string()).collect(),
            available_modules: self.available.clone(),
            outcomes: outcomes.values().cloned().collect(),
        }
    }
}

/// Commits the detection stream, then the summary, then settles the run. A run
/// abandoned at any point before settling leaves neither file behind.
fn persist(
    mut summary: ModuleSummary,
    writer: DetectionWriter,
    summary_path: &Path,
    settle: &AtomicU8,
) -> Result<ModuleSummary, ModuleError> {
    summary.total_detections = writer.count();
    let cancel = writer.cancel_handle();
    let index_path = writer.commit()?;
    if cancel.load(Ordering::Acquire) {
        let _ = fs::remove_file(&index_path);
        return Err(ModuleError::Cancelled);
    }
    if let Err(e) = write_summary(summary_path, &summary) {
        let _ = fs::remove_file(&index_path);
        return Err(e);
    }
    if settle
        .compare_exchange(PENDING, COMMITTED, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        let _ = fs::remove_file(summary_path);
        let _ = fs::remove_file(&index_path);
        return Err(ModuleError::Cancelled);
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::module_trait::Detection;
    use crate::analysis::output::{read_detections, read_summary};
    use crate::decoder::parser::tests::tcp_frame;
    use crate::decoder::types::{LinkType, RawFrame};
    use crate::storage::capture_writer::CaptureWriter;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    struct Counting;

    impl AnalysisModule for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn analyze(
            &self,
            capture: &Path,
            _output_dir: &Path,
            _interface: &str,
            window: &TimeWindow,
            detections: &mut DetectionWriter,
        ) -> Result<ModuleSummary, ModuleError> {
            let mut summary = ModuleSummary::new(self.name(), window, capture);
            for (idx, frame) in crate::storage::reader::CaptureReader::open(capture)?.enumerate() {
                let frame = frame?;
                summary.total_packets += 1;
                detections.emit(&Detection::new(idx as u64 + 1, frame.ts_sec(), "seen"))?;
            }
            summary.analyzed_packets = summary.total_packets;
            Ok(summary.finish())
        }
    }

    struct Broken;

    impl AnalysisModule for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn analyze(
            &self,
            _capture: &Path,
            _output_dir: &Path,
            _interface: &str,
            _window: &TimeWindow,
            detections: &mut DetectionWriter,
        ) -> Result<ModuleSummary, ModuleError> {
            detections.emit(&Detection::new(1, 0, "partial"))?;
            Err(ModuleError::Failed("boom".into()))
        }
    }

    struct Panicking;

    impl AnalysisModule for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn analyze(
            &self,
            _capture: &Path,
            _output_dir: &Path,
            _interface: &str,
            _window: &TimeWindow,
            _detections: &mut DetectionWriter,
        ) -> Result<ModuleSummary, ModuleError> {
            panic!("module bug");
        }
    }

    struct Slow;

    impl AnalysisModule for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn analyze(
            &self,
            _capture: &Path,
            _output_dir: &Path,
            _interface: &str,
            _window: &TimeWindow,
            detections: &mut DetectionWriter,
        ) -> Result<ModuleSummary, ModuleError> {
            loop {
                std::thread::sleep(Duration::from_millis(10));
                detections.emit(&Detection::new(1, 0, "tick"))?;
            }
        }
    }

    /// Ignores cancellation and returns a clean summary shortly after its deadline.
    struct Late(Duration);

    impl AnalysisModule for Late {
        fn name(&self) -> &str {
            "late"
        }

        fn analyze(
            &self,
            capture: &Path,
            _output_dir: &Path,
            _interface: &str,
            window: &TimeWindow,
            _detections: &mut DetectionWriter,
        ) -> Result<ModuleSummary, ModuleError> {
            std::thread::sleep(self.0);
            Ok(ModuleSummary::new(self.name(), window, capture).finish())
        }
    }

    fn boxed<M: AnalysisModule + 'static>(module: M) -> Arc<dyn AnalysisModule> {
        Arc::new(module)
    }

    fn window() -> TimeWindow {
        TimeWindow::new("eth0", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), 10)
    }

    fn capture(root: &Path, packets: usize) -> PathBuf {
        let path = window().capture_path(root);
        let mut w = CaptureWriter::create(&path, 1518, LinkType::Ethernet).unwrap();
        for i in 0..packets {
            let bytes = tcp_frame(50000 + i as u16, 443, b"");
            w.write(&RawFrame::new(1_714_557_600 + i as i64, 0, bytes.len() as u32, bytes))
                .unwrap();
        }
        w.close().unwrap();
        path
    }

    fn runner(root: &Path, timeout: Duration, modules: Vec<Arc<dyn AnalysisModule>>) -> Arc<ModuleRunner> {
        let mut registry = ModuleRegistry::new();
        for m in modules {
            registry.register(m);
        }
        let config = RunnerConfig {
            root: root.to_path_buf(),
            workers: 2,
            timeout,
            enabled: None,
        };
        Arc::new(ModuleRunner::new(config, &registry).unwrap())
    }

    #[tokio::test]
    async fn failing_module_does_not_affect_siblings() {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = TempDir::new().unwrap();
        let path = capture(tmp.path(), 3);
        let runner = runner(tmp.path(), Duration::from_secs(5), vec![boxed(Counting), boxed(Broken)]);

        let records = runner.analyze_now(&path, &window()).await;
        assert_eq!(records.len(), 2);

        let good = runner.outcome("counting", &window()).unwrap();
        assert_eq!(good.outcome, RunOutcome::Succeeded { detections: 3, packets: 3 });
        let bad = runner.outcome("broken", &window()).unwrap();
        assert!(matches!(bad.outcome, RunOutcome::Failed { ref reason } if reason.contains("boom")));

        let (summary, index) = window().module_output_paths(tmp.path(), "counting");
        assert_eq!(read_summary(&summary).unwrap().total_detections, 3);
        assert_eq!(read_detections(&index).unwrap().len(), 3);

        let (summary, index) = window().module_output_paths(tmp.path(), "broken");
        assert!(!summary.exists());
        assert!(!index.exists());

        let status = runner.status();
        assert_eq!((status.completed, status.failed, status.queued, status.running), (1, 1, 0, 0));
    }

    #[tokio::test]
    async fn panicking_module_is_recorded() {
        let tmp = TempDir::new().unwrap();
        let path = capture(tmp.path(), 1);
        let runner = runner(tmp.path(), Duration::from_secs(5), vec![boxed(Panicking), boxed(Counting)]);

        runner.analyze_now(&path, &window()).await;
        let rec = runner.outcome("panicking", &window()).unwrap();
        assert!(matches!(rec.outcome, RunOutcome::Failed { ref reason } if reason.contains("panicked")));
        assert!(runner.outcome("counting", &window()).unwrap().outcome.is_success());
        let (_, index) = window().module_output_paths(tmp.path(), "panicking");
        assert!(!index.exists());
    }

    #[tokio::test]
    async fn slow_module_times_out_without_outputs() {
        let tmp = TempDir::new().unwrap();
        let path = capture(tmp.path(), 1);
        let runner = runner(tmp.path(), Duration::from_millis(100), vec![boxed(Slow), boxed(Counting)]);

        runner.analyze_now(&path, &window()).await;
        let rec = runner.outcome("slow", &window()).unwrap();
        assert!(matches!(rec.outcome, RunOutcome::TimedOut { .. }));
        assert!(runner.outcome("counting", &window()).unwrap().outcome.is_success());

        // Give the cancelled worker time to observe the flag and unwind.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (summary, index) = window().module_output_paths(tmp.path(), "slow");
        assert!(!summary.exists());
        assert!(!index.exists());
        assert!(!index.with_file_name(format!(
            "{}.tmp",
            index.file_name().unwrap().to_string_lossy()
        ))
        .exists());
    }

    #[tokio::test]
    async fn module_returning_after_deadline_leaves_no_outputs() {
        let tmp = TempDir::new().unwrap();
        let path = capture(tmp.path(), 1);
        let runner = runner(tmp.path(), Duration::from_millis(50), vec![boxed(Late(Duration::from_millis(200)))]);

        runner.analyze_now(&path, &window()).await;
        let rec = runner.outcome("late", &window()).unwrap();
        assert!(matches!(rec.outcome, RunOutcome::TimedOut { .. }));
        assert_eq!(runner.status().stalled, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runner.status().stalled, 0);
        let (summary, index) = window().module_output_paths(tmp.path(), "late");
        assert!(!summary.exists());
        assert!(!index.exists());
    }

    #[test]
    fn abandoned_run_discards_committed_outputs() {
        let tmp = TempDir::new().unwrap();
        let path = capture(tmp.path(), 1);
        let (summary_path, index_path) = window().module_output_paths(tmp.path(), "late");
        let mut writer = DetectionWriter::create(&index_path).unwrap();
        writer.emit(&Detection::new(1, 0, "seen")).unwrap();

        // Deadline acted on after the cancel flag was last checked.
        let settle = AtomicU8::new(ABANDONED);
        let summary = ModuleSummary::new("late", &window(), &path).finish();
        let result = persist(summary, writer, &summary_path, &settle);

        assert!(matches!(result, Err(ModuleError::Cancelled)));
        assert!(!summary_path.exists());
        assert!(!index_path.exists());
    }

    #[tokio::test]
    async fn reanalysis_overwrites_outputs() {
        let tmp = TempDir::new().unwrap();
        let path = capture(tmp.path(), 4);
        let runner = runner(tmp.path(), Duration::from_secs(5), vec![boxed(Counting)]);

        runner.analyze_now(&path, &window()).await;
        runner.analyze_now(&path, &window()).await;

        let (_, index) = window().module_output_paths(tmp.path(), "counting");
        assert_eq!(read_detections(&index).unwrap().len(), 4);
        assert_eq!(runner.status().outcomes.len(), 1);
        assert_eq!(runner.status().completed, 2);
    }

    #[tokio::test]
    async fn spawned_runner_drains_handoffs() {
        let tmp = TempDir::new().unwrap();
        let path = capture(tmp.path(), 2);
        let runner = runner(tmp.path(), Duration::from_secs(5), vec![boxed(Counting)]);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = runner.clone().spawn(rx);

        tx.send(CompletedCapture {
            path: path.clone(),
            window: window(),
            packets: 2,
            bytes: 0,
        })
        .unwrap();
        drop(tx);
        tokio_test::assert_ok!(handle.await);

        assert_eq!(runner.status().completed, 1);
        let (summary, _) = window().module_output_paths(tmp.path(), "counting");
        assert_eq!(read_summary(&summary).unwrap().total_packets, 2);
    }

    #[test]
    fn zero_workers_rejected() {
        let config = RunnerConfig {
            root: PathBuf::from("/tmp"),
            workers: 0,
            timeout: Duration::from_secs(1),
            enabled: None,
        };
        assert!(ModuleRunner::new(config, &ModuleRegistry::with_builtins()).is_err());
    }
}
