use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use pcap_file::pcap::PcapReader;
use serde::Serialize;

use crate::decoder::types::{LinkType, RawFrame};
use crate::error_handling::types::PersistenceError;

/// Sequential reader over a closed capture file.
pub struct CaptureReader {
    path: PathBuf,
    inner: PcapReader<BufReader<File>>,
    snaplen: u32,
    link_type: LinkType,
}

impl CaptureReader {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let read_err = |reason: String| PersistenceError::Read {
            path: path.to_path_buf(),
            reason,
        };
        let file = File::open(path).map_err(|e| read_err(e.to_string()))?;
        let inner = PcapReader::new(BufReader::new(file)).map_err(|e| read_err(e.to_string()))?;
        let header = inner.header();
        Ok(Self {
            path: path.to_path_buf(),
            snaplen: header.snaplen,
            link_type: LinkType::from_code(u32::from(header.datalink)),
            inner,
        })
    }

    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }
}

impl Iterator for CaptureReader {
    type Item = Result<RawFrame, PersistenceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let packet = self.inner.next_packet()?;
        Some(
            packet
                .map(|pkt| {
                    RawFrame::new(
                        pkt.timestamp.as_secs() as i64,
                        pkt.timestamp.subsec_micros(),
                        pkt.orig_len,
                        pkt.data.into_owned(),
                    )
                })
                .map_err(|e| PersistenceError::Read {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }),
        )
    }
}

/// Reads every frame of `path` into memory.
pub fn read_frames(path: &Path) -> Result<Vec<RawFrame>, PersistenceError> {
    CaptureReader::open(path)?.collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureInfo {
    pub path: PathBuf,
    pub packets: u64,
    pub bytes: u64,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
    pub duration_secs: f64,
    pub snaplen: u32,
    pub link_type: u32,
}

pub fn capture_info(path: &Path) -> Result<CaptureInfo, PersistenceError> {
    let reader = CaptureReader::open(path)?;
    let mut info = CaptureInfo {
        path: path.to_path_buf(),
        packets: 0,
        bytes: 0,
        first: None,
        last: None,
        duration_secs: 0.0,
        snaplen: reader.snaplen(),
        link_type: reader.link_type().code(),
    };
    for frame in reader {
        let frame = frame?;
        info.packets += 1;
        info.bytes += frame.cap_len() as u64;
        let ts = frame.timestamp();
        if info.first.is_none() {
            info.first = Some(ts);
        }
        info.last = Some(ts);
    }
    if let (Some(first), Some(last)) = (info.first, info.last) {
        info.duration_secs = (last - first).num_microseconds().unwrap_or(0) as f64 / 1e6;
    }
    Ok(info)
}
