use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::warn;

use crate::analysis::module_trait::{top_n, AnalysisModule, Detection, ModuleSummary};
use crate::analysis::output::DetectionWriter;
use crate::decoder::{Decoder, PacketSummary};
use crate::error_handling::types::ModuleError;
use crate::storage::reader::CaptureReader;
use crate::storage::time_window::TimeWindow;

pub const PORT_SCAN: &str = "port-scan";
pub const HIGH_RATE_SOURCE: &str = "high-rate-source";

const TOP: usize = 10;
const MAX_ERRORS: usize = 10;

/// Built-in module: protocol distribution, top talkers, and two simple
/// anomaly detections (many destination ports from one source, and one source
/// sending a large share of packets).
pub struct ProtocolStats {
    pub port_scan_threshold: usize,
    pub high_rate_threshold: u64,
}

impl Default for ProtocolStats {
    fn default() -> Self {
        Self {
            port_scan_threshold: 20,
            high_rate_threshold: 1000,
        }
    }
}

impl AnalysisModule for ProtocolStats {
    fn name(&self) -> &str {
        "protocol_stats"
    }

    fn description(&self) -> &str {
        "Protocol distribution, top talkers, port-scan and high-rate source detection"
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
        let reader = CaptureReader::open(capture)?;
        let decoder = Decoder::new(reader.link_type());

        let mut protocols: HashMap<String, u64> = HashMap::new();
        let mut sources: HashMap<String, u64> = HashMap::new();
        let mut destinations: HashMap<String, u64> = HashMap::new();
        let mut ports_by_source: HashMap<String, HashSet<u16>> = HashMap::new();
        let mut labels: HashMap<String, u64> = HashMap::new();

        for (idx, frame) in reader.enumerate() {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    // A torn record ends the readable part of the file.
                    warn!("[module {}] {}", self.name(), e);
                    summary.errors.push(e.to_string());
                    break;
                }
            };
            summary.total_packets += 1;
            let seq = idx as u64 + 1;
            let packet = decoder.decode(seq, frame);
            let info = PacketSummary::from(&packet);
            if info.decode_error && summary.errors.len() < MAX_ERRORS {
                if let Some(issue) = packet.issue() {
                    summary.errors.push(format!("packet {}: {}", seq, issue));
                }
            }
            summary.analyzed_packets += 1;

            *protocols.entry(info.protocol.clone()).or_default() += 1;
            // Link-layer addresses are only a fallback when no IP layer exists.
            let has_ip = packet.ipv4().is_some() || packet.ipv6().is_some() || packet.arp().is_some();
            let (src, dst) = if has_ip {
                (info.src.clone(), info.dst.clone())
            } else {
                (None, None)
            };

            if let Some(dst) = &dst {
                *destinations.entry(dst.clone()).or_default() += 1;
            }
            let src = match src {
                Some(src) => src,
                None => continue,
            };
            let count = sources.entry(src.clone()).or_default();
            *count += 1;
            if *count == self.high_rate_threshold {
                let det = Detection {
                    src: Some(src.clone()),
                    ..Detection::new(seq, info.ts_sec, HIGH_RATE_SOURCE)
                }
                .with_attribute("packet_count", *count);
                detections.emit(&det)?;
                *labels.entry(HIGH_RATE_SOURCE.to_string()).or_default() += 1;
            }

            if let Some(port) = info.dst_port {
                let ports = ports_by_source.entry(src.clone()).or_default();
                if ports.insert(port) && ports.len() == self.port_scan_threshold {
                    let det = Detection {
                        src: Some(src.clone()),
                        dst: dst.clone(),
                        dst_port: Some(port),
                        proto: Some(info.protocol.clone()),
                        ..Detection::new(seq, info.ts_sec, PORT_SCAN)
                    }
                    .with_attribute("unique_ports", ports.len());
                    detections.emit(&det)?;
                    *labels.entry(PORT_SCAN.to_string()).or_default() += 1;
                }
            }
        }

        summary.total_detections = detections.count();
        for label in [PORT_SCAN, HIGH_RATE_SOURCE] {
            summary
                .labels
                .insert(label.to_string(), labels.get(label).copied().unwrap_or(0));
        }
        for (proto, count) in top_n(&protocols, TOP) {
            summary.labels.insert(format!("proto_{}", proto), count);
        }
        summary.top_sources = top_n(&sources, TOP);
        summary.top_destinations = top_n(&destinations, TOP);
        Ok(summary.finish())
    }
}
