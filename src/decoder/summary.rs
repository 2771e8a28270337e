use serde::Serialize;

use super::names::*;
use super::types::{DecodedPacket, IcmpVersion};

/// One-line view of a decoded packet, as shown by the live feed and used by
/// analysis modules for counting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketSummary {
    pub seq: u64,
    pub ts_sec: i64,
    pub ts_usec: u32,
    pub length: u32,
    pub protocol: String,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub info: String,
    pub decode_error: bool,
}

fn port_hint(src: u16, dst: u16) -> String {
    match port_name(src).or_else(|| port_name(dst)) {
        Some(name) => format!(" ({})", name),
        None => String::new(),
    }
}

impl From<&DecodedPacket> for PacketSummary {
    fn from(pkt: &DecodedPacket) -> Self {
        let frame = pkt.frame();
        let mut summary = PacketSummary {
            seq: pkt.seq(),
            ts_sec: frame.ts_sec(),
            ts_usec: frame.ts_usec(),
            length: frame.orig_len(),
            protocol: String::from("UNKNOWN"),
            src: None,
            dst: None,
            src_port: None,
            dst_port: None,
            info: String::new(),
            decode_error: pkt.decode_error(),
        };

        if let Some(eth) = pkt.ethernet() {
            summary.protocol = ethertype_name(eth.ethertype);
            summary.src = Some(eth.src.to_string());
            summary.dst = Some(eth.dst.to_string());
        }

        if let Some(arp) = pkt.arp() {
            summary.protocol = String::from("ARP");
            match &arp.addresses {
                Some(addrs) => {
                    summary.src = Some(addrs.sender_ip.to_string());
                    summary.dst = Some(addrs.target_ip.to_string());
                    summary.info = format!(
                        "{}: {} -> {}",
                        arp_op_name(arp.opcode),
                        addrs.sender_ip,
                        addrs.target_ip
                    );
                }
                None => summary.info = arp_op_name(arp.opcode),
            }
        }

        if let Some(ip) = pkt.ipv4() {
            summary.protocol = String::from("IPv4");
            if let (Some(src), Some(dst)) = (ip.src(), ip.dst()) {
                summary.src = Some(src.to_string());
                summary.dst = Some(dst.to_string());
            }
            if let Some(proto) = ip.protocol() {
                summary.protocol = ip_protocol_name(proto);
            }
        }

        if let Some(ip) = pkt.ipv6() {
            summary.protocol = ip_protocol_name(ip.upper_protocol);
            summary.src = Some(ip.src.to_string());
            summary.dst = Some(ip.dst.to_string());
        }

        if let Some(tcp) = pkt.tcp() {
            summary.protocol = String::from("TCP");
            summary.src_port = Some(tcp.src_port);
            summary.dst_port = Some(tcp.dst_port);
            summary.info = format!(
                "{} -> {}{} {} Seq={}",
                tcp.src_port,
                tcp.dst_port,
                port_hint(tcp.src_port, tcp.dst_port),
                tcp_flags_string(tcp.flags.0),
                tcp.seq
            );
        } else if let Some(udp) = pkt.udp() {
            summary.protocol = String::from("UDP");
            summary.src_port = Some(udp.src_port);
            summary.dst_port = Some(udp.dst_port);
            summary.info = format!(
                "{} -> {}{} Len={}",
                udp.src_port,
                udp.dst_port,
                port_hint(udp.src_port, udp.dst_port),
                udp.length
            );
        } else if let Some(icmp) = pkt.icmp() {
            let (protocol, name) = match icmp.version {
                IcmpVersion::V4 => ("ICMP", icmp_type_name(icmp.icmp_type)),
                IcmpVersion::V6 => ("ICMPv6", icmpv6_type_name(icmp.icmp_type)),
            };
            summary.protocol = protocol.to_string();
            summary.info = format!("{} (code={})", name, icmp.code);
        }

        if let Some(issue) = pkt.issue() {
            if summary.info.is_empty() {
                summary.info = issue.to_string();
            }
        }
        summary
    }
}
