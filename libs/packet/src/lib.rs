//! Best-effort decoding of raw L3/L4 bytes into a flow tuple, plus a
//! stand-alone TLS Client Hello SNI extractor.
//!
//! Both routines are pure functions over byte slices: no I/O, no
//! allocation beyond what's returned to the caller. Malformed or truncated
//! input never produces an error — fields that can't be read are simply
//! left unset, matching how the netfilter readers use this on packets that
//! the kernel handed over with arbitrary truncation. Header decoding itself
//! is delegated to `etherparse` rather than hand-rolled, the same crate the
//! fuller `IpPacket` builder in the retrieval pack is built on.

mod sni;

pub use sni::extract_sni;

use etherparse::{IpNumber, IpSlice};

/// A hardware (MAC) address, as observed by a netfilter reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl MacAddr {
    /// Extracts the source hardware address from an Ethernet header, i.e.
    /// bytes `6..12`. Returns `None` if fewer than 14 bytes are present.
    pub fn from_ethernet_header(frame: &[u8]) -> Option<Self> {
        if frame.len() < 14 {
            return None;
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&frame[6..12]);
        Some(MacAddr(mac))
    }
}

/// Decoded fields of an IPv4/IPv6 + TCP/UDP/ICMP packet.
///
/// Every field is optional: the parser never fails, it just stops filling
/// in fields once it runs out of bytes or hits something it doesn't
/// recognise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPacket {
    pub ip_version: Option<u8>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    /// "TCP", "UDP", "ICMP", "ICMPv6", or "IP/<n>" for anything else.
    pub protocol: Option<String>,
    pub total_len: Option<u16>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

fn protocol_name(proto: IpNumber) -> String {
    match proto {
        IpNumber::TCP => "TCP".to_string(),
        IpNumber::UDP => "UDP".to_string(),
        IpNumber::ICMP => "ICMP".to_string(),
        IpNumber::IPV6_ICMP => "ICMPv6".to_string(),
        other => format!("IP/{}", other.0),
    }
}

/// Parses a byte slice presumed to contain an IPv4 or IPv6 packet starting
/// at the network header. Never errors; see module docs.
pub fn parse(data: &[u8]) -> ParsedPacket {
    let mut pkt = ParsedPacket::default();

    let Ok(ip) = IpSlice::from_slice(data) else {
        return pkt;
    };

    pkt.ip_version = Some(match ip {
        IpSlice::Ipv4(_) => 4,
        IpSlice::Ipv6(_) => 6,
    });
    pkt.src_ip = Some(ip.source_addr().to_string());
    pkt.dst_ip = Some(ip.destination_addr().to_string());

    let proto = ip.payload_ip_number();
    pkt.protocol = Some(protocol_name(proto));

    let header_len = match &ip {
        IpSlice::Ipv4(ipv4) => ipv4.header().ihl() as usize * 4 + ipv4.extensions().auth.map_or(0, |ext| ext.slice().len()),
        IpSlice::Ipv6(ipv6) => ipv6.header().header_len() + ipv6.extensions().slice().len(),
    };
    let transport = ip.payload().payload;
    pkt.total_len = u16::try_from(header_len + transport.len()).ok();

    if matches!(proto, IpNumber::TCP | IpNumber::UDP) {
        parse_ports(transport, &mut pkt);
    }

    pkt
}

fn parse_ports(transport: &[u8], pkt: &mut ParsedPacket) {
    if transport.len() < 4 {
        return;
    }
    pkt.src_port = Some(u16::from_be_bytes([transport[0], transport[1]]));
    pkt.dst_port = Some(u16::from_be_bytes([transport[2], transport[3]]));
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a well-formed IPv4 header (ihl=5, no options) followed by
    /// `payload`, with `total_len` set consistently with the real buffer
    /// size the way a real packet would be.
    fn ipv4_packet(proto: u8, ihl: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0u8; 20];
        v[0] = 0x40 | ihl;
        let total_len = (v.len() + payload.len()) as u16;
        v[2..4].copy_from_slice(&total_len.to_be_bytes());
        v[9] = proto;
        v[12..16].copy_from_slice(&[192, 168, 1, 10]);
        v[16..20].copy_from_slice(&[1, 1, 1, 1]);
        v.extend_from_slice(payload);
        v
    }

    const PROTO_TCP: u8 = IpNumber::TCP.0;
    const PROTO_ICMPV6: u8 = IpNumber::IPV6_ICMP.0;

    #[test]
    fn ipv4_tcp_with_ports() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&443u16.to_be_bytes()); // src port
        payload.extend_from_slice(&51234u16.to_be_bytes()); // dst port
        payload.extend_from_slice(&[0, 0, 0, 0]);
        let data = ipv4_packet(PROTO_TCP, 5, &payload);

        let pkt = parse(&data);
        assert_eq!(pkt.ip_version, Some(4));
        assert_eq!(pkt.protocol.as_deref(), Some("TCP"));
        assert_eq!(pkt.src_ip.as_deref(), Some("192.168.1.10"));
        assert_eq!(pkt.dst_ip.as_deref(), Some("1.1.1.1"));
        assert_eq!(pkt.src_port, Some(443));
        assert_eq!(pkt.dst_port, Some(51234));
    }

    #[test]
    fn ipv4_ihl_below_minimum_is_rejected_wholesale() {
        // An IHL below 5 makes the header itself invalid, so etherparse
        // refuses the whole packet rather than salvaging a protocol/ports.
        let data = ipv4_packet(PROTO_TCP, 4, &[]);
        let pkt = parse(&data);
        assert_eq!(pkt, ParsedPacket::default());
    }

    #[test]
    fn ipv6_icmpv6_has_no_ports() {
        let mut data = vec![0u8; 40];
        data[0] = 0x60;
        data[6] = PROTO_ICMPV6;
        data[8..24].copy_from_slice(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        data[24..40].copy_from_slice(&[0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);

        let pkt = parse(&data);
        assert_eq!(pkt.ip_version, Some(6));
        assert_eq!(pkt.protocol.as_deref(), Some("ICMPv6"));
        assert_eq!(pkt.total_len, Some(40));
        assert_eq!(pkt.src_port, None);
    }

    #[test]
    fn unknown_protocol_formats_as_ip_slash_n() {
        let data = ipv4_packet(200, 5, &[]);
        let pkt = parse(&data);
        assert_eq!(pkt.protocol.as_deref(), Some("IP/200"));
    }

    #[test]
    fn truncated_input_never_panics() {
        for len in 0..20 {
            let data = vec![0x45u8; len];
            let _ = parse(&data);
        }
    }

    #[test]
    fn mac_from_short_frame_is_none() {
        assert_eq!(MacAddr::from_ethernet_header(&[0u8; 13]), None);
    }

    #[test]
    fn mac_from_ethernet_header() {
        let mut frame = vec![0u8; 14];
        frame[6..12].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
        let mac = MacAddr::from_ethernet_header(&frame).unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:01");
    }
}
