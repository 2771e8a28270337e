use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::decoder::types::{LinkType, RawFrame};
use crate::error_handling::types::PersistenceError;
use crate::storage::pcap_format::{global_header, record_header};

const WRITE_BUFFER: usize = 256 * 1024;

/// Append-only writer for one capture file.
///
/// The global header is written once by `create`. Any I/O failure poisons the
/// writer: later writes fail with `PersistenceError::Poisoned` so no frame is
/// silently lost after a partial record.
pub struct CaptureWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    snaplen: u32,
    packets: u64,
    bytes: u64,
    poisoned: bool,
}

impl CaptureWriter {
    /// Creates `path` exclusively (an existing file is an error) and writes the
    /// global header.
    pub fn create(path: &Path, snaplen: u32, link_type: LinkType) -> Result<Self, PersistenceError> {
        let create_err = |source| PersistenceError::Create {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(create_err)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(create_err)?;

        let mut out = BufWriter::with_capacity(WRITE_BUFFER, file);
        out.write_all(&global_header(snaplen, link_type.code()))
            .map_err(|source| PersistenceError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Opened capture file {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            out: Some(out),
            snaplen,
            packets: 0,
            bytes: 0,
            poisoned: false,
        })
    }

    pub fn write(&mut self, frame: &RawFrame) -> Result<(), PersistenceError> {
        if self.poisoned {
            return Err(PersistenceError::Poisoned(self.path.clone()));
        }
        let out = match self.out.as_mut() {
            Some(out) => out,
            None => return Err(PersistenceError::Closed(self.path.clone())),
        };

        let cap_len = frame.cap_len().min(self.snaplen);
        let header = record_header(frame, cap_len);
        let result = out
            .write_all(&header)
            .and_then(|_| out.write_all(&frame.data()[..cap_len as usize]));
        if let Err(source) = result {
            self.poisoned = true;
            error!("Write to {} failed: {}", self.path.display(), source);
            return Err(PersistenceError::Write {
                path: self.path.clone(),
                source,
            });
        }
        self.packets += 1;
        self.bytes += cap_len as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), PersistenceError> {
        if self.poisoned {
            return Err(PersistenceError::Poisoned(self.path.clone()));
        }
        if let Some(out) = self.out.as_mut() {
            if let Err(source) = out.flush() {
                self.poisoned = true;
                return Err(PersistenceError::Flush {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Flushes, syncs and marks the file read-only. The writer cannot be used
    /// afterwards.
    pub fn close(&mut self) -> Result<(), PersistenceError> {
        if self.poisoned {
            self.out = None;
            return Err(PersistenceError::Poisoned(self.path.clone()));
        }
        let out = match self.out.take() {
            Some(out) => out,
            None => return Err(PersistenceError::Closed(self.path.clone())),
        };
        let file = out.into_inner().map_err(|e| PersistenceError::Flush {
            path: self.path.clone(),
            source: e.into_error(),
        })?;
        file.sync_all().map_err(|source| PersistenceError::Flush {
            path: self.path.clone(),
            source,
        })?;

        match file.metadata() {
            Ok(meta) => {
                let mut perms = meta.permissions();
                perms.set_readonly(true);
                if let Err(e) = fs::set_permissions(&self.path, perms) {
                    warn!("Cannot mark {} read-only: {}", self.path.display(), e);
                }
            }
            Err(e) => warn!("Cannot stat {}: {}", self.path.display(), e),
        }
        debug!(
            "Closed capture file {} ({} packets, {} bytes)",
            self.path.display(),
            self.packets,
            self.bytes
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn is_open(&self) -> bool {
        self.out.is_some() && !self.poisoned
    }
}

impl Drop for CaptureWriter {
    fn drop(&mut self) {
        if let Some(mut out) = self.out.take() {
            if !self.poisoned {
                let _ = out.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcap_file::pcap::PcapReader;
    use tempfile::TempDir;

    fn frames() -> Vec<RawFrame> {
        vec![
            RawFrame::new(1_700_000_000, 1, 60, vec![1u8; 60]),
            RawFrame::new(1_700_000_001, 999_999, 1500, vec![2u8; 64]),
            RawFrame::new(1_700_000_002, 42, 14, vec![3u8; 14]),
        ]
    }

    #[test]
    fn written_file_reads_back_with_independent_reader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raw/2024-01-01/eth0_2024-01-01_00.pcap");
        let mut writer = CaptureWriter::create(&path, 1518, LinkType::Ethernet).unwrap();
        for f in frames() {
            writer.write(&f).unwrap();
        }
        writer.close().unwrap();

        let file = File::open(&path).unwrap();
        let mut reader = PcapReader::new(file).unwrap();
        assert_eq!(reader.header().snaplen, 1518);
        let mut got = Vec::new();
        while let Some(pkt) = reader.next_packet() {
            let pkt = pkt.unwrap();
            got.push((
                pkt.timestamp.as_secs() as i64,
                pkt.timestamp.subsec_micros(),
                pkt.orig_len,
                pkt.data.to_vec(),
            ));
        }
        let want: Vec<_> = frames()
            .into_iter()
            .map(|f| (f.ts_sec(), f.ts_usec(), f.orig_len(), f.data().to_vec()))
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn existing_file_is_never_reopened() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.pcap");
        let mut writer = CaptureWriter::create(&path, 1518, LinkType::Ethernet).unwrap();
        writer.close().unwrap();
        assert!(matches!(
            CaptureWriter::create(&path, 1518, LinkType::Ethernet),
            Err(PersistenceError::Create { .. })
        ));
    }

    #[test]
    fn closed_writer_rejects_frames() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.pcap");
        let mut writer = CaptureWriter::create(&path, 1518, LinkType::Ethernet).unwrap();
        writer.close().unwrap();
        assert!(!writer.is_open());
        assert!(matches!(
            writer.write(&frames()[0]),
            Err(PersistenceError::Closed(_))
        ));
        assert!(fs::metadata(&path).unwrap().permissions().readonly());
    }

    #[test]
    fn frames_longer_than_snaplen_are_cut() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.pcap");
        let mut writer = CaptureWriter::create(&path, 64, LinkType::Ethernet).unwrap();
        writer
            .write(&RawFrame::new(1, 0, 200, vec![7u8; 200]))
            .unwrap();
        writer.close().unwrap();
        assert_eq!(writer.bytes(), 64);
        assert_eq!(fs::metadata(&path).unwrap().len(), 24 + 16 + 64);
    }
}
