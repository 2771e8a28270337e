#[cfg(test)]
mod integration_tests {
    use crate::analysis::module_trait::{AnalysisModule, ModuleSummary};
    use crate::analysis::output::{read_detections, read_summary, DetectionWriter};
    use crate::analysis::protocol_stats::ProtocolStats;
    use crate::analysis::registry::ModuleRegistry;
    use crate::analysis::runner::RunOutcome;
    use crate::configuration::config::Config;
    use crate::controller::controller_handler::{Controller, RunSummary};
    use crate::data_capture::consumer::Consumer;
    use crate::data_capture::queue::FrameQueue;
    use crate::data_capture::source::SyntheticSource;
    use crate::data_capture::stats::CaptureCounters;
    use crate::decoder::names::{ETHERTYPE_IPV4, PROTO_TCP};
    use crate::decoder::parser::tests::{ethernet_header, ipv4_header, tcp_frame};
    use crate::decoder::types::{LinkType, RawFrame};
    use crate::decoder::{decode, Decoder};
    use crate::error_handling::types::ModuleError;
    use crate::storage::catalog::list_capture_files;
    use crate::storage::rotator::{Rotator, RotatorConfig};
    use crate::storage::time_window::{TimeWindow, WindowZone};
    use chrono::{NaiveDate, TimeZone, Utc};
    use pcap_file::pcap::PcapReader;
    use std::fs::{self, File};
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    const LIMIT: Duration = Duration::from_secs(20);

    fn at(hour: u32, min: u32, sec: u32) -> i64 {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, min, sec).unwrap().timestamp()
    }

    fn tcp(ts: i64, sport: u16) -> RawFrame {
        let bytes = tcp_frame(sport, 443, b"hello");
        RawFrame::new(ts, 0, bytes.len() as u32, bytes)
    }

    /// Ethernet header followed by the first 10 bytes of an IPv4 header.
    fn truncated_ipv4(ts: i64) -> RawFrame {
        let mut bytes = ethernet_header(ETHERTYPE_IPV4);
        bytes.extend_from_slice(&ipv4_header(PROTO_TCP, 20, [10, 0, 0, 1], [10, 0, 0, 2])[..10]);
        RawFrame::new(ts, 0, bytes.len() as u32, bytes)
    }

    fn config(root: &Path) -> Config {
        let mut config = Config::default();
        config.capture.interface = "test0".into();
        config.storage.output_root = root.to_path_buf();
        config.storage.time_zone = WindowZone::Utc;
        // Replayed frames are old; keep them regardless of age.
        config.storage.retention_days = 0;
        config.analysis.module_timeout_secs = 10;
        config
    }

    fn window(hour: u32) -> TimeWindow {
        TimeWindow::new("test0", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(), hour)
    }

    async fn replay(controller: &Controller, frames: Vec<RawFrame>) -> RunSummary {
        let source = Box::new(SyntheticSource::new(frames));
        timeout(LIMIT, controller.run_with_source(source, std::future::pending::<()>()))
            .await
            .expect("pipeline did not finish")
            .expect("pipeline failed")
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
            _detections: &mut DetectionWriter,
        ) -> Result<ModuleSummary, ModuleError> {
            Err(ModuleError::Failed("cannot cope".into()))
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_counted_and_persisted() {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = TempDir::new().unwrap();
        let controller = Controller::new(config(tmp.path()))
            .unwrap()
            .with_tick_interval(Duration::from_secs(3600));

        let frames = vec![
            tcp(at(10, 0, 1), 50001),
            tcp(at(10, 0, 2), 50002),
            truncated_ipv4(at(10, 0, 3)),
            tcp(at(10, 0, 4), 50003),
        ];
        let summary = replay(&controller, frames.clone()).await;

        assert_eq!(summary.stats.packets_seen, 4);
        assert_eq!(summary.stats.packets_written, 4);
        assert_eq!(summary.stats.queue_drops, 0);
        assert_eq!(summary.stats.decode_errors, 1);

        let broken = decode(3, truncated_ipv4(at(10, 0, 3)));
        assert!(broken.decode_error());
        assert_eq!(broken.layer_names(), vec!["Ethernet", "IPv4"]);

        // Writer round trip through an independent reader.
        let path = window(10).capture_path(tmp.path());
        let mut reader = PcapReader::new(File::open(&path).unwrap()).unwrap();
        let mut records = Vec::new();
        while let Some(packet) = reader.next_packet() {
            records.push(packet.unwrap().into_owned());
        }
        assert_eq!(records.len(), 4);
        for (record, frame) in records.iter().zip(&frames) {
            assert_eq!(record.data.as_ref(), frame.data());
            assert_eq!(record.orig_len, frame.orig_len());
            assert_eq!(record.timestamp.as_secs() as i64, frame.ts_sec());
        }
        assert!(fs::metadata(&path).unwrap().permissions().readonly());

        let (summary_path, _) = window(10).module_output_paths(tmp.path(), "protocol_stats");
        let module_summary = read_summary(&summary_path).unwrap();
        assert_eq!(module_summary.total_packets, 4);
        assert_eq!(module_summary.time_window, "2024-05-01_10");
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_excess_without_blocking() {
        let tmp = TempDir::new().unwrap();
        let counters = Arc::new(CaptureCounters::default());
        let (queue, rx) =
            FrameQueue::bounded(2, 1518, counters.clone(), Arc::new(AtomicBool::new(false)));
        for n in 0..5 {
            queue.offer(tcp(at(11, 0, n), 40000 + n as u16));
        }
        drop(queue);

        let (handoff_tx, mut handoff_rx) = mpsc::unbounded_channel();
        let rotator = Rotator::new(
            RotatorConfig {
                root: tmp.path().to_path_buf(),
                interface: "test0".into(),
                snaplen: 1518,
                link_type: LinkType::Ethernet,
                retention_days: 0,
                zone: WindowZone::Utc,
            },
            handoff_tx,
        );
        let consumer = Consumer::new("test0", Decoder::default(), Box::new(rotator), counters.clone());
        let report = consumer.run(rx).await.unwrap();

        assert_eq!(counters.seen(), 5);
        assert_eq!(counters.queue_drops(), 3);
        assert_eq!(report.decoded, 2);
        let completed = handoff_rx.recv().await.unwrap();
        assert_eq!(completed.packets, 2);
        assert!(handoff_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_hour_boundary_rotates_and_analyzes_both_windows() {
        let tmp = TempDir::new().unwrap();
        let controller = Controller::new(config(tmp.path()))
            .unwrap()
            .with_tick_interval(Duration::from_secs(3600));

        let frames = vec![
            tcp(at(13, 59, 58), 50001),
            tcp(at(13, 59, 59), 50002),
            tcp(at(14, 0, 1), 50003),
        ];
        let summary = replay(&controller, frames).await;
        assert_eq!(summary.rotator.files_completed, 2);

        let files = list_capture_files(tmp.path(), Some("test0"), None).unwrap();
        let windows: Vec<u32> = files.iter().map(|(w, _)| w.hour).collect();
        assert_eq!(windows, vec![13, 14]);

        let analysis = summary.analysis.unwrap();
        assert_eq!(analysis.completed, 2);
        assert_eq!(analysis.failed, 0);
        for (hour, packets) in [(13, 2), (14, 1)] {
            let (summary_path, index_path) = window(hour).module_output_paths(tmp.path(), "protocol_stats");
            assert_eq!(read_summary(&summary_path).unwrap().total_packets, packets);
            assert!(read_detections(&index_path).unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_failing_module_is_isolated() {
        let tmp = TempDir::new().unwrap();
        let mut registry = ModuleRegistry::new();
        registry.register(Arc::new(ProtocolStats::default()));
        registry.register(Arc::new(Broken));
        let controller = Controller::with_registry(config(tmp.path()), registry)
            .unwrap()
            .with_tick_interval(Duration::from_secs(3600));

        let summary = replay(&controller, vec![tcp(at(9, 0, 0), 1234)]).await;
        assert_eq!(summary.stats.packets_written, 1);

        let analysis = summary.analysis.unwrap();
        assert_eq!(analysis.completed, 1);
        assert_eq!(analysis.failed, 1);
        let broken = analysis.outcomes.iter().find(|o| o.module == "broken").unwrap();
        assert!(matches!(broken.outcome, RunOutcome::Failed { .. }));
        assert_eq!(broken.window, window(9));

        let (good, _) = window(9).module_output_paths(tmp.path(), "protocol_stats");
        assert!(good.exists());
        let (bad_summary, bad_index) = window(9).module_output_paths(tmp.path(), "broken");
        assert!(!bad_summary.exists());
        assert!(!bad_index.exists());
    }

    #[tokio::test]
    async fn test_retention_removes_old_days_only() {
        let tmp = TempDir::new().unwrap();
        let old = tmp.path().join("raw/2000-01-01");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("test0_2000-01-01_00.pcap"), b"").unwrap();

        let mut config = config(tmp.path());
        config.storage.retention_days = 7;
        let controller = Controller::new(config)
            .unwrap()
            .with_tick_interval(Duration::from_secs(3600));

        let now = Utc::now().timestamp();
        let summary = replay(&controller, vec![tcp(now, 1), tcp(now, 2)]).await;
        assert_eq!(summary.rotator.files_completed, 1);

        assert!(!old.exists());
        let today = WindowZone::Utc.today(Utc::now());
        let files = list_capture_files(tmp.path(), None, Some(today)).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_finalizes_open_file() {
        let tmp = TempDir::new().unwrap();
        let controller = Controller::new(config(tmp.path()))
            .unwrap()
            .with_tick_interval(Duration::from_secs(3600));
        let source = SyntheticSource::new(vec![tcp(at(20, 0, 0), 1), tcp(at(20, 0, 1), 2)]).keep_open();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let _ = stop_tx.send(());
        });
        let summary = timeout(
            LIMIT,
            controller.run_with_source(Box::new(source), async move {
                let _ = stop_rx.await;
            }),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(summary.stats.packets_written, 2);
        assert_eq!(summary.rotator.files_completed, 1);
        assert!(summary.rotator.current_file.is_none());
        let (summary_path, _) = window(20).module_output_paths(tmp.path(), "protocol_stats");
        assert_eq!(read_summary(&summary_path).unwrap().total_packets, 2);
    }
}
