//! Frame and layer types produced by the decoder.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error_handling::types::DecodeIssue;

/// One captured link-layer frame exactly as it came off the wire.
///
/// Fields are private so a frame cannot be altered once produced; the captured
/// length is always `<= orig_len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    ts_sec: i64,
    ts_usec: u32,
    orig_len: u32,
    data: Vec<u8>,
}

impl RawFrame {
    /// Builds a frame from already captured bytes. `orig_len` is raised to the
    /// captured length if a source reports something smaller.
    pub fn new(ts_sec: i64, ts_usec: u32, orig_len: u32, data: Vec<u8>) -> Self {
        let cap_len = data.len() as u32;
        Self {
            ts_sec,
            ts_usec: ts_usec.min(999_999),
            orig_len: orig_len.max(cap_len),
            data,
        }
    }

    /// Builds a frame from wire bytes, keeping at most `snaplen` of them.
    pub fn truncated(ts_sec: i64, ts_usec: u32, wire: &[u8], snaplen: u32) -> Self {
        let keep = wire.len().min(snaplen as usize);
        Self::new(ts_sec, ts_usec, wire.len() as u32, wire[..keep].to_vec())
    }

    /// Same frame, cut down to `snaplen` if it is longer.
    pub fn limit(self, snaplen: u32) -> Self {
        if self.data.len() <= snaplen as usize {
            return self;
        }
        let mut data = self.data;
        data.truncate(snaplen as usize);
        Self {
            data,
            ..self
        }
    }

    pub fn ts_sec(&self) -> i64 {
        self.ts_sec
    }

    pub fn ts_usec(&self) -> u32 {
        self.ts_usec
    }

    pub fn orig_len(&self) -> u32 {
        self.orig_len
    }

    pub fn cap_len(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.ts_sec, self.ts_usec * 1_000).unwrap_or_default()
    }
}

/// Link-layer framing of the frames a source delivers (pcap LINKTYPE values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkType {
    Ethernet,
    /// Raw IP, version taken from the first nibble.
    RawIp,
    Ipv4,
    Ipv6,
    /// Linux "cooked" capture used by the `any` pseudo interface.
    LinuxSll,
    Other(u32),
}

impl LinkType {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => LinkType::Ethernet,
            12 | 14 | 101 => LinkType::RawIp,
            113 => LinkType::LinuxSll,
            228 => LinkType::Ipv4,
            229 => LinkType::Ipv6,
            other => LinkType::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            LinkType::Ethernet => 1,
            LinkType::RawIp => 101,
            LinkType::LinuxSll => 113,
            LinkType::Ipv4 => 228,
            LinkType::Ipv6 => 229,
            LinkType::Other(code) => *code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[..6]);
        MacAddr(mac)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EthernetLayer {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// EtherType after any 802.1Q tag.
    pub ethertype: u16,
    pub vlan_id: Option<u16>,
}

/// Stand-in for the link layer when frames are already IP-level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStub {
    pub link_type: LinkType,
    pub ethertype: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArpAddresses {
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArpLayer {
    pub hw_type: u16,
    pub proto_type: u16,
    pub hw_size: u8,
    pub proto_size: u8,
    pub opcode: u16,
    /// Only present for Ethernet/IPv4 ARP; other address families keep the raw codes above.
    pub addresses: Option<ArpAddresses>,
}

/// The fixed 20-byte part of an IPv4 header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ipv4Fixed {
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ipv4Layer {
    pub version: u8,
    /// Header length in bytes, as declared by the IHL field.
    pub header_len: usize,
    /// `None` when the frame ends before the fixed header does.
    pub fixed: Option<Ipv4Fixed>,
}

impl Ipv4Layer {
    pub fn src(&self) -> Option<Ipv4Addr> {
        self.fixed.as_ref().map(|f| f.src)
    }

    pub fn dst(&self) -> Option<Ipv4Addr> {
        self.fixed.as_ref().map(|f| f.dst)
    }

    pub fn protocol(&self) -> Option<u8> {
        self.fixed.as_ref().map(|f| f.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ipv6Layer {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub payload_length: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    /// Extension headers walked before the upper-layer protocol, in order.
    pub extension_headers: Vec<u8>,
    /// Upper-layer protocol after the extension header chain.
    pub upper_protocol: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
    pub const ECE: u8 = 0x40;
    pub const CWR: u8 = 0x80;

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TcpLayer {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes, from the data offset field.
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UdpLayer {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IcmpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IcmpLayer {
    pub version: IcmpVersion,
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub rest_of_header: u32,
}

/// Bytes after the last decoded header, kept as a range into the frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayloadLayer {
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Layer {
    Ethernet(EthernetLayer),
    LinkStub(LinkStub),
    Arp(ArpLayer),
    Ipv4(Ipv4Layer),
    Ipv6(Ipv6Layer),
    Tcp(TcpLayer),
    Udp(UdpLayer),
    Icmp(IcmpLayer),
    Payload(PayloadLayer),
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Ethernet(_) => "Ethernet",
            Layer::LinkStub(_) => "Link",
            Layer::Arp(_) => "ARP",
            Layer::Ipv4(_) => "IPv4",
            Layer::Ipv6(_) => "IPv6",
            Layer::Tcp(_) => "TCP",
            Layer::Udp(_) => "UDP",
            Layer::Icmp(_) => "ICMP",
            Layer::Payload(_) => "Payload",
        }
    }
}

/// A frame plus the protocol layers the decoder could read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPacket {
    seq: u64,
    frame: RawFrame,
    layers: Vec<Layer>,
    issue: Option<DecodeIssue>,
}

impl DecodedPacket {
    pub(crate) fn new(
        seq: u64,
        frame: RawFrame,
        layers: Vec<Layer>,
        issue: Option<DecodeIssue>,
    ) -> Self {
        Self {
            seq,
            frame,
            layers,
            issue,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn frame(&self) -> &RawFrame {
        &self.frame
    }

    pub fn into_frame(self) -> RawFrame {
        self.frame
    }

    /// Layers in wire order (link first, payload last).
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn decode_error(&self) -> bool {
        self.issue.is_some()
    }

    pub fn issue(&self) -> Option<&DecodeIssue> {
        self.issue.as_ref()
    }

    pub fn ethernet(&self) -> Option<&EthernetLayer> {
        self.layers.iter().find_map(|l| match l {
            Layer::Ethernet(e) => Some(e),
            _ => None,
        })
    }

    pub fn arp(&self) -> Option<&ArpLayer> {
        self.layers.iter().find_map(|l| match l {
            Layer::Arp(a) => Some(a),
            _ => None,
        })
    }

    pub fn ipv4(&self) -> Option<&Ipv4Layer> {
        self.layers.iter().find_map(|l| match l {
            Layer::Ipv4(ip) => Some(ip),
            _ => None,
        })
    }

    pub fn ipv6(&self) -> Option<&Ipv6Layer> {
        self.layers.iter().find_map(|l| match l {
            Layer::Ipv6(ip) => Some(ip),
            _ => None,
        })
    }

    pub fn tcp(&self) -> Option<&TcpLayer> {
        self.layers.iter().find_map(|l| match l {
            Layer::Tcp(t) => Some(t),
            _ => None,
        })
    }

    pub fn udp(&self) -> Option<&UdpLayer> {
        self.layers.iter().find_map(|l| match l {
            Layer::Udp(u) => Some(u),
            _ => None,
        })
    }

    pub fn icmp(&self) -> Option<&IcmpLayer> {
        self.layers.iter().find_map(|l| match l {
            Layer::Icmp(i) => Some(i),
            _ => None,
        })
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.layers.iter().find_map(|l| match l {
            Layer::Payload(p) => self.frame.data().get(p.offset..p.offset + p.len),
            _ => None,
        })
    }

    /// Layer names in order, e.g. `["Ethernet", "IPv4", "TCP"]`.
    pub fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(Layer::name).collect()
    }
}
