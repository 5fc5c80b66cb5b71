use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

/// Minimal projection of a captured packet: the fields the rule engine
/// needs plus a printable summary for logs. `protocol` is the IPv4 `proto`
/// field or the IPv6 next header.
#[derive(Debug, Clone)]
pub struct PacketView {
    pub src_ip: String,
    pub dst_ip: String,
    pub protocol: u8,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub tcp_flags: Option<String>,
    pub summary: String,
}

impl PacketView {
    pub fn is_tcp(&self) -> bool {
        self.protocol == 6
    }
}

/// Maps an IP protocol number to its display name.
pub fn protocol_name(number: u8) -> String {
    let name = match number {
        1 => "ICMP",
        2 => "IGMP",
        4 => "IP",
        6 => "TCP",
        17 => "UDP",
        50 => "ESP",
        51 => "AH",
        58 => "ICMPv6",
        88 => "EIGRP",
        89 => "OSPF",
        132 => "SCTP",
        other => return format!("Unknown protocol {}", other),
    };
    name.to_string()
}

/// TCP flag bits rendered as the conventional single letters.
fn flag_letters(raw: u32) -> String {
    const LETTERS: [(u32, char); 6] = [
        (0x01, 'F'),
        (0x02, 'S'),
        (0x04, 'R'),
        (0x08, 'P'),
        (0x10, 'A'),
        (0x20, 'U'),
    ];
    let mut letters = String::new();
    for (bit, letter) in LETTERS {
        if raw & bit != 0 {
            letters.push(letter);
        }
    }
    letters
}

/// Parses an Ethernet frame into a `PacketView`. Returns `None` for frames
/// without an IPv4 or IPv6 layer.
pub fn from_ethernet(data: &[u8]) -> Option<PacketView> {
    let ethernet = EthernetPacket::new(data)?;
    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ipv4 = Ipv4Packet::new(ethernet.payload())?;
            let protocol = ipv4.get_next_level_protocol().0;
            Some(build_view(
                ipv4.get_source().to_string(),
                ipv4.get_destination().to_string(),
                protocol,
                ipv4.payload(),
            ))
        }
        EtherTypes::Ipv6 => {
            let ipv6 = Ipv6Packet::new(ethernet.payload())?;
            let protocol = ipv6.get_next_header().0;
            Some(build_view(
                ipv6.get_source().to_string(),
                ipv6.get_destination().to_string(),
                protocol,
                ipv6.payload(),
            ))
        }
        _ => None,
    }
}

fn build_view(src_ip: String, dst_ip: String, protocol: u8, payload: &[u8]) -> PacketView {
    let mut src_port = None;
    let mut dst_port = None;
    let mut tcp_flags = None;

    match protocol {
        6 => {
            if let Some(tcp) = TcpPacket::new(payload) {
                src_port = Some(tcp.get_source());
                dst_port = Some(tcp.get_destination());
                tcp_flags = Some(flag_letters(u32::from(tcp.get_flags())));
            }
        }
        17 => {
            if let Some(udp) = UdpPacket::new(payload) {
                src_port = Some(udp.get_source());
                dst_port = Some(udp.get_destination());
            }
        }
        _ => {}
    }

    let name = protocol_name(protocol);
    let summary = match (src_port, dst_port) {
        (Some(sport), Some(dport)) => {
            format!("{} {}:{} > {}:{}", name, src_ip, sport, dst_ip, dport)
        }
        _ => format!("{} {} > {}", name, src_ip, dst_ip),
    };

    PacketView {
        src_ip,
        dst_ip,
        protocol,
        src_port,
        dst_port,
        tcp_flags,
        summary,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_frame_extraction() {
        let frame = build::tcp_frame("10.0.0.5", "192.168.1.2", 1234, 80, 0x12);
        let view = from_ethernet(&frame).unwrap();

        assert_eq!(view.src_ip, "10.0.0.5");
        assert_eq!(view.dst_ip, "192.168.1.2");
        assert_eq!(view.protocol, 6);
        assert!(view.is_tcp());
        assert_eq!(view.src_port, Some(1234));
        assert_eq!(view.dst_port, Some(80));
        assert_eq!(view.tcp_flags.as_deref(), Some("SA"));
        assert_eq!(view.summary, "TCP 10.0.0.5:1234 > 192.168.1.2:80");
    }

    #[test]
    fn test_udp_frame_extraction() {
        let frame = build::udp_frame("10.0.0.5", "8.8.8.8", 5353, 53);
        let view = from_ethernet(&frame).unwrap();

        assert_eq!(view.protocol, 17);
        assert!(!view.is_tcp());
        assert_eq!(view.dst_port, Some(53));
        assert!(view.tcp_flags.is_none());
    }

    #[test]
    fn test_non_ip_frame_rejected() {
        // ARP ethertype.
        let mut frame = vec![0u8; 42];
        frame[12] = 0x08;
        frame[13] = 0x06;
        assert!(from_ethernet(&frame).is_none());

        assert!(from_ethernet(&[0u8; 4]).is_none());
    }

    #[test]
    fn test_protocol_name_table() {
        assert_eq!(protocol_name(1), "ICMP");
        assert_eq!(protocol_name(6), "TCP");
        assert_eq!(protocol_name(17), "UDP");
        assert_eq!(protocol_name(58), "ICMPv6");
        assert_eq!(protocol_name(132), "SCTP");
        assert_eq!(protocol_name(47), "Unknown protocol 47");
    }

    #[test]
    fn test_flag_letters() {
        assert_eq!(flag_letters(0x02), "S");
        assert_eq!(flag_letters(0x12), "SA");
        assert_eq!(flag_letters(0x00), "");
        assert_eq!(flag_letters(0x3f), "FSRPAU");
    }
}
