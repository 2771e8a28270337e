//! Layer-by-layer decoding of raw frames.
//!
//! Every step checks the bytes it needs before reading them and advances by the
//! length the header itself declares. The first failing step ends the walk: the
//! layers read so far are kept and the failure is stored on the packet.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error_handling::types::DecodeIssue;

use super::names::*;
use super::types::*;

/// Stateless decoder bound to the link type of one capture source.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    link_type: LinkType,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(LinkType::Ethernet)
    }
}

impl Decoder {
    pub fn new(link_type: LinkType) -> Self {
        Self { link_type }
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Decodes `frame` into a packet numbered `seq`. Never fails: malformed input
    /// yields a partial layer chain with the decode error flag set.
    pub fn decode(&self, seq: u64, frame: RawFrame) -> DecodedPacket {
        let (layers, issue) = walk(self.link_type, frame.data());
        DecodedPacket::new(seq, frame, layers, issue)
    }
}

/// Decodes an Ethernet frame.
pub fn decode(seq: u64, frame: RawFrame) -> DecodedPacket {
    Decoder::default().decode(seq, frame)
}

type Step<T> = Result<T, DecodeIssue>;

fn need(layer: &'static str, data: &[u8], needed: usize) -> Step<()> {
    if data.len() < needed {
        return Err(DecodeIssue::Truncated {
            layer,
            needed,
            available: data.len(),
        });
    }
    Ok(())
}

fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

/// Where the upper-layer protocol sits inside a network-layer slice.
struct Upper {
    protocol: u8,
    start: usize,
    end: usize,
    fragment: bool,
}

fn walk(link_type: LinkType, data: &[u8]) -> (Vec<Layer>, Option<DecodeIssue>) {
    let mut layers = Vec::with_capacity(4);

    let (ethertype, net_offset) = match link(link_type, data) {
        Ok((layer, ethertype, offset)) => {
            layers.push(layer);
            (ethertype, offset)
        }
        Err(issue) => return (layers, Some(issue)),
    };
    let net = &data[net_offset..];

    let (upper, icmp_version) = match ethertype {
        ETHERTYPE_IPV4 => {
            let (layer, upper) = ipv4(net);
            if let Some(layer) = layer {
                layers.push(Layer::Ipv4(layer));
            }
            match upper {
                Ok(upper) => (upper, IcmpVersion::V4),
                Err(issue) => return (layers, Some(issue)),
            }
        }
        ETHERTYPE_IPV6 => {
            let (layer, upper) = ipv6(net);
            if let Some(layer) = layer {
                layers.push(Layer::Ipv6(layer));
            }
            match upper {
                Ok(upper) => (upper, IcmpVersion::V6),
                Err(issue) => return (layers, Some(issue)),
            }
        }
        ETHERTYPE_ARP => {
            let (layer, issue) = arp(net);
            if let Some(layer) = layer {
                layers.push(Layer::Arp(layer));
            }
            return (layers, issue);
        }
        // Unknown EtherType: the raw code stays on the link layer.
        _ => return (layers, None),
    };

    let segment = &net[upper.start..upper.end];
    let payload_base = net_offset + upper.start;

    // Non-first fragments carry no transport header.
    if upper.fragment {
        push_payload(&mut layers, payload_base, segment.len());
        return (layers, None);
    }

    let transport = match (upper.protocol, icmp_version) {
        (PROTO_TCP, _) => tcp(segment),
        (PROTO_UDP, _) => udp(segment),
        (PROTO_ICMP, IcmpVersion::V4) | (PROTO_ICMPV6, IcmpVersion::V6) => {
            icmp(segment, icmp_version)
        }
        _ => return (layers, None),
    };

    match transport {
        (Some(layer), Ok(header_len)) => {
            layers.push(layer);
            push_payload(
                &mut layers,
                payload_base + header_len,
                segment.len() - header_len,
            );
            (layers, None)
        }
        (layer, Err(issue)) => {
            if let Some(layer) = layer {
                layers.push(layer);
            }
            (layers, Some(issue))
        }
        (None, Ok(_)) => (layers, None),
    }
}

fn push_payload(layers: &mut Vec<Layer>, offset: usize, len: usize) {
    if len > 0 {
        layers.push(Layer::Payload(PayloadLayer { offset, len }));
    }
}

fn link(link_type: LinkType, data: &[u8]) -> Step<(Layer, u16, usize)> {
    match link_type {
        LinkType::Ethernet => {
            need("Ethernet", data, 14)?;
            let dst = MacAddr::from_slice(&data[0..6]);
            let src = MacAddr::from_slice(&data[6..12]);
            let mut ethertype = be16(data, 12);
            let mut offset = 14;
            let mut vlan_id = None;
            if ethertype == ETHERTYPE_VLAN {
                need("Ethernet", data, 18)?;
                vlan_id = Some(be16(data, 14) & 0x0fff);
                ethertype = be16(data, 16);
                offset = 18;
            }
            let layer = Layer::Ethernet(EthernetLayer {
                dst,
                src,
                ethertype,
                vlan_id,
            });
            Ok((layer, ethertype, offset))
        }
        LinkType::RawIp => {
            need("Link", data, 1)?;
            let ethertype = match data[0] >> 4 {
                4 => ETHERTYPE_IPV4,
                6 => ETHERTYPE_IPV6,
                v => {
                    return Err(DecodeIssue::InvalidHeader {
                        layer: "Link",
                        reason: format!("raw IP frame with version {}", v),
                    })
                }
            };
            Ok((stub(link_type, ethertype), ethertype, 0))
        }
        LinkType::Ipv4 => Ok((stub(link_type, ETHERTYPE_IPV4), ETHERTYPE_IPV4, 0)),
        LinkType::Ipv6 => Ok((stub(link_type, ETHERTYPE_IPV6), ETHERTYPE_IPV6, 0)),
        LinkType::LinuxSll => {
            need("Link", data, 16)?;
            let ethertype = be16(data, 14);
            Ok((stub(link_type, ethertype), ethertype, 16))
        }
        LinkType::Other(code) => Err(DecodeIssue::InvalidHeader {
            layer: "Link",
            reason: format!("unsupported link type {}", code),
        }),
    }
}

fn stub(link_type: LinkType, ethertype: u16) -> Layer {
    Layer::LinkStub(LinkStub {
        link_type,
        ethertype,
    })
}

fn ipv4(data: &[u8]) -> (Option<Ipv4Layer>, Step<Upper>) {
    if let Err(issue) = need("IPv4", data, 1) {
        return (None, Err(issue));
    }
    let version = data[0] >> 4;
    let header_len = ((data[0] & 0x0f) as usize) * 4;
    if version != 4 {
        let issue = DecodeIssue::InvalidHeader {
            layer: "IPv4",
            reason: format!("version field is {}", version),
        };
        return (None, Err(issue));
    }

    let mut layer = Ipv4Layer {
        version,
        header_len,
        fixed: None,
    };
    if let Err(issue) = need("IPv4", data, 20) {
        return (Some(layer), Err(issue));
    }

    let flags_frag = be16(data, 6);
    let fixed = Ipv4Fixed {
        tos: data[1],
        total_length: be16(data, 2),
        identification: be16(data, 4),
        flags: (flags_frag >> 13) as u8,
        fragment_offset: flags_frag & 0x1fff,
        ttl: data[8],
        protocol: data[9],
        checksum: be16(data, 10),
        src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
    };
    let total_length = fixed.total_length as usize;
    let protocol = fixed.protocol;
    let fragment = fixed.fragment_offset != 0;
    layer.fixed = Some(fixed);

    if header_len < 20 {
        let issue = DecodeIssue::InvalidHeader {
            layer: "IPv4",
            reason: format!("header length {} below minimum of 20", header_len),
        };
        return (Some(layer), Err(issue));
    }
    if let Err(issue) = need("IPv4", data, header_len) {
        return (Some(layer), Err(issue));
    }
    if total_length < header_len {
        let issue = DecodeIssue::InvalidHeader {
            layer: "IPv4",
            reason: format!(
                "total length {} shorter than header length {}",
                total_length, header_len
            ),
        };
        return (Some(layer), Err(issue));
    }

    // Bytes past total_length are link padding; a short capture just ends early.
    let end = total_length.min(data.len());
    let upper = Upper {
        protocol,
        start: header_len,
        end,
        fragment,
    };
    (Some(layer), Ok(upper))
}

const IPV6_HOP_BY_HOP: u8 = 0;
const IPV6_ROUTING: u8 = 43;
const IPV6_FRAGMENT: u8 = 44;
const IPV6_AUTH: u8 = 51;
const IPV6_DEST_OPTS: u8 = 60;

fn ipv6(data: &[u8]) -> (Option<Ipv6Layer>, Step<Upper>) {
    if let Err(issue) = need("IPv6", data, 40) {
        return (None, Err(issue));
    }
    let first = be32(data, 0);
    let version = (first >> 28) as u8;
    if version != 6 {
        let issue = DecodeIssue::InvalidHeader {
            layer: "IPv6",
            reason: format!("version field is {}", version),
        };
        return (None, Err(issue));
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    dst.copy_from_slice(&data[24..40]);
    let payload_length = be16(data, 4);
    let next_header = data[6];

    let mut layer = Ipv6Layer {
        traffic_class: ((first >> 20) & 0xff) as u8,
        flow_label: first & 0x000f_ffff,
        payload_length,
        next_header,
        hop_limit: data[7],
        src: Ipv6Addr::from(src),
        dst: Ipv6Addr::from(dst),
        extension_headers: Vec::new(),
        upper_protocol: next_header,
    };

    let end = if payload_length == 0 {
        data.len()
    } else {
        (40 + payload_length as usize).min(data.len())
    };

    let mut next = next_header;
    let mut pos = 40;
    let mut fragment = false;
    loop {
        let ext_len = match next {
            IPV6_HOP_BY_HOP | IPV6_ROUTING | IPV6_DEST_OPTS => {
                if let Err(issue) = need("IPv6 extension", &data[pos..end], 2) {
                    return (Some(layer), Err(issue));
                }
                (data[pos + 1] as usize + 1) * 8
            }
            IPV6_AUTH => {
                if let Err(issue) = need("IPv6 extension", &data[pos..end], 2) {
                    return (Some(layer), Err(issue));
                }
                (data[pos + 1] as usize + 2) * 4
            }
            IPV6_FRAGMENT => 8,
            _ => break,
        };
        if let Err(issue) = need("IPv6 extension", &data[pos..end], ext_len) {
            return (Some(layer), Err(issue));
        }
        if next == IPV6_FRAGMENT {
            fragment = be16(data, pos + 2) >> 3 != 0;
        }
        layer.extension_headers.push(next);
        next = data[pos];
        pos += ext_len;
    }
    layer.upper_protocol = next;

    let upper = Upper {
        protocol: next,
        start: pos,
        end,
        fragment,
    };
    (Some(layer), Ok(upper))
}

fn arp(data: &[u8]) -> (Option<ArpLayer>, Option<DecodeIssue>) {
    if let Err(issue) = need("ARP", data, 8) {
        return (None, Some(issue));
    }
    let mut layer = ArpLayer {
        hw_type: be16(data, 0),
        proto_type: be16(data, 2),
        hw_size: data[4],
        proto_size: data[5],
        opcode: be16(data, 6),
        addresses: None,
    };
    if layer.hw_size != 6 || layer.proto_size != 4 || layer.proto_type != ETHERTYPE_IPV4 {
        return (Some(layer), None);
    }
    if let Err(issue) = need("ARP", data, 28) {
        return (Some(layer), Some(issue));
    }
    layer.addresses = Some(ArpAddresses {
        sender_mac: MacAddr::from_slice(&data[8..14]),
        sender_ip: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
        target_mac: MacAddr::from_slice(&data[18..24]),
        target_ip: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
    });
    (Some(layer), None)
}

fn tcp(data: &[u8]) -> (Option<Layer>, Step<usize>) {
    if let Err(issue) = need("TCP", data, 20) {
        return (None, Err(issue));
    }
    let header_len = ((data[12] >> 4) as usize) * 4;
    let layer = Layer::Tcp(TcpLayer {
        src_port: be16(data, 0),
        dst_port: be16(data, 2),
        seq: be32(data, 4),
        ack: be32(data, 8),
        header_len,
        flags: TcpFlags(data[13]),
        window: be16(data, 14),
        checksum: be16(data, 16),
        urgent: be16(data, 18),
    });
    if header_len < 20 {
        let issue = DecodeIssue::InvalidHeader {
            layer: "TCP",
            reason: format!("data offset {} below minimum of 20", header_len),
        };
        return (Some(layer), Err(issue));
    }
    if let Err(issue) = need("TCP", data, header_len) {
        return (Some(layer), Err(issue));
    }
    (Some(layer), Ok(header_len))
}

fn udp(data: &[u8]) -> (Option<Layer>, Step<usize>) {
    if let Err(issue) = need("UDP", data, 8) {
        return (None, Err(issue));
    }
    let layer = Layer::Udp(UdpLayer {
        src_port: be16(data, 0),
        dst_port: be16(data, 2),
        length: be16(data, 4),
        checksum: be16(data, 6),
    });
    (Some(layer), Ok(8))
}

fn icmp(data: &[u8], version: IcmpVersion) -> (Option<Layer>, Step<usize>) {
    if let Err(issue) = need("ICMP", data, 8) {
        return (None, Err(issue));
    }
    let layer = Layer::Icmp(IcmpLayer {
        version,
        icmp_type: data[0],
        code: data[1],
        checksum: be16(data, 2),
        rest_of_header: be32(data, 4),
    });
    (Some(layer), Ok(8))
}
