//! Protocol numbers and human-readable names.

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

pub fn ethertype_name(ethertype: u16) -> String {
    match ethertype {
        ETHERTYPE_IPV4 => "IPv4".to_string(),
        ETHERTYPE_ARP => "ARP".to_string(),
        ETHERTYPE_IPV6 => "IPv6".to_string(),
        ETHERTYPE_VLAN => "VLAN".to_string(),
        other => format!("0x{:04x}", other),
    }
}

pub fn ip_protocol_name(protocol: u8) -> String {
    match protocol {
        PROTO_ICMP => "ICMP".to_string(),
        PROTO_TCP => "TCP".to_string(),
        PROTO_UDP => "UDP".to_string(),
        PROTO_ICMPV6 => "ICMPv6".to_string(),
        other => other.to_string(),
    }
}

const TCP_FLAG_NAMES: [(u8, &str); 8] = [
    (0x01, "FIN"),
    (0x02, "SYN"),
    (0x04, "RST"),
    (0x08, "PSH"),
    (0x10, "ACK"),
    (0x20, "URG"),
    (0x40, "ECE"),
    (0x80, "CWR"),
];

/// `[SYN,ACK]` style rendering; empty string when no flag is set.
pub fn tcp_flags_string(flags: u8) -> String {
    let names: Vec<&str> = TCP_FLAG_NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        String::new()
    } else {
        format!("[{}]", names.join(","))
    }
}

pub fn icmp_type_name(icmp_type: u8) -> String {
    match icmp_type {
        0 => "Echo Reply".to_string(),
        3 => "Destination Unreachable".to_string(),
        5 => "Redirect".to_string(),
        8 => "Echo Request".to_string(),
        11 => "Time Exceeded".to_string(),
        other => format!("Type {}", other),
    }
}

pub fn icmpv6_type_name(icmp_type: u8) -> String {
    match icmp_type {
        1 => "Destination Unreachable".to_string(),
        3 => "Time Exceeded".to_string(),
        128 => "Echo Request".to_string(),
        129 => "Echo Reply".to_string(),
        133 => "Router Solicitation".to_string(),
        134 => "Router Advertisement".to_string(),
        135 => "Neighbor Solicitation".to_string(),
        136 => "Neighbor Advertisement".to_string(),
        other => format!("Type {}", other),
    }
}

pub fn arp_op_name(opcode: u16) -> String {
    match opcode {
        ARP_REQUEST => "Request".to_string(),
        ARP_REPLY => "Reply".to_string(),
        other => format!("Op {}", other),
    }
}

pub fn port_name(port: u16) -> Option<&'static str> {
    let name = match port {
        20 => "FTP-DATA",
        21 => "FTP",
        22 => "SSH",
        23 => "TELNET",
        25 => "SMTP",
        53 => "DNS",
        67 => "DHCP-S",
        68 => "DHCP-C",
        80 => "HTTP",
        110 => "POP3",
        123 => "NTP",
        143 => "IMAP",
        443 => "HTTPS",
        445 => "SMB",
        993 => "IMAPS",
        995 => "POP3S",
        3306 => "MySQL",
        3389 => "RDP",
        5432 => "PostgreSQL",
        6379 => "Redis",
        8080 => "HTTP-ALT",
        8443 => "HTTPS-ALT",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_render_in_bit_order() {
        assert_eq!(tcp_flags_string(0x12), "[SYN,ACK]");
        assert_eq!(tcp_flags_string(0x00), "");
        assert_eq!(tcp_flags_string(0x11), "[FIN,ACK]");
    }

    #[test]
    fn unknown_codes_fall_back_to_numbers() {
        assert_eq!(ethertype_name(0x88cc), "0x88cc");
        assert_eq!(ip_protocol_name(132), "132");
        assert_eq!(icmp_type_name(42), "Type 42");
        assert_eq!(arp_op_name(9), "Op 9");
        assert_eq!(port_name(4242), None);
        assert_eq!(port_name(443), Some("HTTPS"));
    }
}
