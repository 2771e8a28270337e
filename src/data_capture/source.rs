//! Frame sources the wire reader pulls from.

use std::collections::VecDeque;
use std::time::Duration;

use crate::decoder::types::{LinkType, RawFrame};
use crate::error_handling::types::CaptureError;

use super::types::CaptureSettings;

pub enum NextFrame {
    Frame(RawFrame),
    /// Nothing arrived within the read timeout; the caller re-checks its flags.
    Timeout,
    /// The source is exhausted and will never produce another frame.
    Eof,
}

/// Blocking producer of raw frames, driven by the reader thread.
pub trait FrameSource: Send {
    fn link_type(&self) -> LinkType;

    /// Waits a bounded time for the next frame.
    fn next_frame(&mut self) -> Result<NextFrame, CaptureError>;

    /// Frames lost below the queue (kernel ring, driver) since the source opened.
    fn kernel_drops(&mut self) -> Option<u64> {
        None
    }
}

/// Deterministic in-memory source used for replay and tests.
pub struct SyntheticSource {
    frames: VecDeque<RawFrame>,
    link_type: LinkType,
    pace: Option<Duration>,
    keep_open: bool,
}

impl SyntheticSource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames: frames.into(),
            link_type: LinkType::Ethernet,
            pace: None,
            keep_open: false,
        }
    }

    pub fn with_link_type(mut self, link_type: LinkType) -> Self {
        self.link_type = link_type;
        self
    }

    /// Sleeps this long before handing out each frame.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    /// Reports timeouts instead of end-of-stream once drained, like an idle
    /// interface.
    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }
}

impl FrameSource for SyntheticSource {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn next_frame(&mut self) -> Result<NextFrame, CaptureError> {
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }
        match self.frames.pop_front() {
            Some(frame) => Ok(NextFrame::Frame(frame)),
            None if self.keep_open => {
                std::thread::sleep(Duration::from_millis(20));
                Ok(NextFrame::Timeout)
            }
            None => Ok(NextFrame::Eof),
        }
    }
}

#[cfg(feature = "live-capture")]
pub use live::PcapSource;

#[cfg(feature = "live-capture")]
mod live {
    use super::*;
    use crate::error_handling::types::ConfigError;
    use log::debug;
    use pcap::{Active, Capture};

    const READ_TIMEOUT_MS: i32 = 100;

    /// Live interface opened through libpcap.
    pub struct PcapSource {
        cap: Capture<Active>,
        link_type: LinkType,
        drop_baseline: u64,
    }

    fn open_error(interface: &str, err: pcap::Error) -> CaptureError {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("permission") || lower.contains("not permitted") {
            CaptureError::PermissionDenied {
                interface: interface.to_string(),
                reason: msg,
            }
        } else if lower.contains("no such device") || lower.contains("doesn't exist") {
            CaptureError::Configuration(ConfigError::InterfaceNotFound(interface.to_string()))
        } else {
            CaptureError::Device(msg)
        }
    }

    fn total_drops(cap: &mut Capture<Active>) -> u64 {
        cap.stats()
            .map(|s| s.dropped as u64 + s.if_dropped as u64)
            .unwrap_or(0)
    }

    impl PcapSource {
        pub fn open(settings: &CaptureSettings) -> Result<Self, CaptureError> {
            let interface = settings.interface.as_str();
            let mut cap = Capture::from_device(interface)
                .map_err(|e| open_error(interface, e))?
                .snaplen(settings.snaplen as i32)
                .promisc(settings.promiscuous)
                .timeout(READ_TIMEOUT_MS)
                .buffer_size(settings.profile.kernel_buffer() as i32)
                .immediate_mode(true)
                .open()
                .map_err(|e| open_error(interface, e))?;

            if let Some(filter) = settings.filter.as_deref().filter(|f| !f.trim().is_empty()) {
                cap.filter(filter, true).map_err(|e| {
                    CaptureError::Configuration(ConfigError::InvalidFilter {
                        filter: filter.to_string(),
                        reason: e.to_string(),
                    })
                })?;
            }

            let link_type = LinkType::from_code(cap.get_datalink().0 as u32);
            let drop_baseline = total_drops(&mut cap);
            debug!(
                "[{}] libpcap handle open, link type {:?}",
                interface, link_type
            );
            Ok(Self {
                cap,
                link_type,
                drop_baseline,
            })
        }
    }

    impl FrameSource for PcapSource {
        fn link_type(&self) -> LinkType {
            self.link_type
        }

        fn next_frame(&mut self) -> Result<NextFrame, CaptureError> {
            match self.cap.next_packet() {
                Ok(packet) => {
                    let ts = packet.header.ts;
                    Ok(NextFrame::Frame(RawFrame::new(
                        ts.tv_sec as i64,
                        ts.tv_usec as u32,
                        packet.header.len,
                        packet.data.to_vec(),
                    )))
                }
                Err(pcap::Error::TimeoutExpired) => Ok(NextFrame::Timeout),
                Err(pcap::Error::NoMorePackets) => Ok(NextFrame::Eof),
                Err(e) => Err(CaptureError::Device(e.to_string())),
            }
        }

        fn kernel_drops(&mut self) -> Option<u64> {
            Some(total_drops(&mut self.cap).saturating_sub(self.drop_baseline))
        }
    }
}

/// Opens the live interface named in `settings`.
#[cfg(feature = "live-capture")]
pub fn open_live(settings: &CaptureSettings) -> Result<Box<dyn FrameSource>, CaptureError> {
    Ok(Box::new(PcapSource::open(settings)?))
}

#[cfg(not(feature = "live-capture"))]
pub fn open_live(_settings: &CaptureSettings) -> Result<Box<dyn FrameSource>, CaptureError> {
    Err(CaptureError::Device(
        "built without the live-capture feature".to_string(),
    ))
}
