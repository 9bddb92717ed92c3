//! IPv4 header parsing for the firewall.
//!
//! Only the fields the packet filter needs are pulled out; payload bytes
//! are never copied.

use crate::addr::OverlayIp;
use crate::error::{NetError, NetResult};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const MIN_IPV4_HEADER: usize = 20;

/// The 5-tuple view of an overlay packet, oriented so that `local_ip`
/// is always our side regardless of direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FirewallPacket {
    pub local_ip: OverlayIp,
    pub remote_ip: OverlayIp,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: u8,
    pub fragment: bool,
}

/// Parse an IPv4 packet into a [`FirewallPacket`].
///
/// `incoming` controls which addresses land in `local_ip`/`remote_ip`.
/// Non-initial fragments parse with zero ports and `fragment` set; the
/// filter treats those as matching the flow's first fragment.
pub fn parse_ipv4(data: &[u8], incoming: bool) -> NetResult<FirewallPacket> {
    if data.len() < MIN_IPV4_HEADER {
        return Err(NetError::InvalidPacket(format!(
            "packet too short: {} bytes",
            data.len()
        )));
    }

    let version = data[0] >> 4;
    if version != 4 {
        return Err(NetError::InvalidPacket(format!(
            "not an IPv4 packet: version {}",
            version
        )));
    }

    let ihl = ((data[0] & 0x0f) as usize) * 4;
    if ihl < MIN_IPV4_HEADER || data.len() < ihl {
        return Err(NetError::InvalidPacket("bad header length".to_string()));
    }

    let protocol = data[9];
    let src = OverlayIp::from_u32(u32::from_be_bytes([data[12], data[13], data[14], data[15]]));
    let dst = OverlayIp::from_u32(u32::from_be_bytes([data[16], data[17], data[18], data[19]]));

    let frag_offset = ((data[6] as u16 & 0x1f) << 8) | data[7] as u16;
    let fragment = frag_offset > 0;

    let (src_port, dst_port) = if fragment || !matches!(protocol, PROTO_TCP | PROTO_UDP) {
        (0, 0)
    } else {
        if data.len() < ihl + 4 {
            return Err(NetError::InvalidPacket("truncated transport header".to_string()));
        }
        (
            u16::from_be_bytes([data[ihl], data[ihl + 1]]),
            u16::from_be_bytes([data[ihl + 2], data[ihl + 3]]),
        )
    };

    let fp = if incoming {
        FirewallPacket {
            local_ip: dst,
            remote_ip: src,
            local_port: dst_port,
            remote_port: src_port,
            protocol,
            fragment,
        }
    } else {
        FirewallPacket {
            local_ip: src,
            remote_ip: dst,
            local_port: src_port,
            remote_port: dst_port,
            protocol,
            fragment,
        }
    };
    Ok(fp)
}

/// Build a minimal IPv4/UDP packet, used by tests and by the loopback
/// probes the connection manager emits.
pub fn build_ipv4_udp(src: OverlayIp, dst: OverlayIp, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let total = 20 + 8 + payload.len();
    let mut p = vec![0u8; total];
    p[0] = 0x45; // v4, ihl 5
    p[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    p[8] = 64; // ttl
    p[9] = PROTO_UDP;
    p[12..16].copy_from_slice(&src.as_u32().to_be_bytes());
    p[16..20].copy_from_slice(&dst.as_u32().to_be_bytes());
    p[20..22].copy_from_slice(&sport.to_be_bytes());
    p[22..24].copy_from_slice(&dport.to_be_bytes());
    p[24..26].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    p[28..].copy_from_slice(payload);
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> OverlayIp {
        OverlayIp::from(s.parse::<Ipv4Addr>().unwrap())
    }

    #[test]
    fn test_parse_udp_outgoing() {
        let p = build_ipv4_udp(ip("10.0.0.1"), ip("10.0.0.2"), 4000, 80, b"hi");
        let fp = parse_ipv4(&p, false).unwrap();

        assert_eq!(fp.local_ip, ip("10.0.0.1"));
        assert_eq!(fp.remote_ip, ip("10.0.0.2"));
        assert_eq!(fp.local_port, 4000);
        assert_eq!(fp.remote_port, 80);
        assert_eq!(fp.protocol, PROTO_UDP);
        assert!(!fp.fragment);
    }

    #[test]
    fn test_parse_udp_incoming_swaps() {
        let p = build_ipv4_udp(ip("10.0.0.1"), ip("10.0.0.2"), 4000, 80, b"hi");
        let fp = parse_ipv4(&p, true).unwrap();

        assert_eq!(fp.local_ip, ip("10.0.0.2"));
        assert_eq!(fp.remote_ip, ip("10.0.0.1"));
        assert_eq!(fp.local_port, 80);
        assert_eq!(fp.remote_port, 4000);
    }

    #[test]
    fn test_parse_rejects_short() {
        assert!(parse_ipv4(&[0u8; 10], false).is_err());
    }

    #[test]
    fn test_parse_rejects_ipv6() {
        let mut p = build_ipv4_udp(ip("10.0.0.1"), ip("10.0.0.2"), 1, 2, b"");
        p[0] = 0x60;
        assert!(parse_ipv4(&p, false).is_err());
    }

    #[test]
    fn test_fragment_has_zero_ports() {
        let mut p = build_ipv4_udp(ip("10.0.0.1"), ip("10.0.0.2"), 4000, 80, b"hi");
        p[7] = 0x10; // fragment offset 16
        let fp = parse_ipv4(&p, false).unwrap();
        assert!(fp.fragment);
        assert_eq!(fp.local_port, 0);
        assert_eq!(fp.remote_port, 0);
    }
}
