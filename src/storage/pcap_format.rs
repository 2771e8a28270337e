//! Classic libpcap file layout, microsecond timestamps, little-endian.

use crate::decoder::types::RawFrame;

pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 4;
pub const GLOBAL_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

pub fn global_header(snaplen: u32, link_type: u32) -> [u8; GLOBAL_HEADER_LEN] {
    let mut h = [0u8; GLOBAL_HEADER_LEN];
    h[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    h[4..6].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
    h[6..8].copy_from_slice(&VERSION_MINOR.to_le_bytes());
    // thiszone and sigfigs stay zero
    h[16..20].copy_from_slice(&snaplen.to_le_bytes());
    h[20..24].copy_from_slice(&link_type.to_le_bytes());
    h
}

/// Record header for `frame` once cut to `cap_len` stored bytes.
pub fn record_header(frame: &RawFrame, cap_len: u32) -> [u8; RECORD_HEADER_LEN] {
    let ts_sec = u32::try_from(frame.ts_sec()).unwrap_or(0);
    let mut h = [0u8; RECORD_HEADER_LEN];
    h[0..4].copy_from_slice(&ts_sec.to_le_bytes());
    h[4..8].copy_from_slice(&frame.ts_usec().to_le_bytes());
    h[8..12].copy_from_slice(&cap_len.to_le_bytes());
    h[12..16].copy_from_slice(&frame.orig_len().max(cap_len).to_le_bytes());
    h
}
