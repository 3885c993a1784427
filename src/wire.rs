//! Minimal Ethernet + IPv4 + UDP framing for pcap capture and replay.

use std::net::{Ipv4Addr, SocketAddr};

const ETH_LEN: usize = 14;
const UDP_LEN: usize = 8;

/// UDP datagram pulled out of a captured link-layer frame.
pub struct UdpDatagram<'a> {
    pub src: SocketAddr,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

/// Parse an Ethernet II / IPv4 / UDP frame. Anything else yields `None`.
pub fn parse_udp_frame(frame: &[u8]) -> Option<UdpDatagram<'_>> {
    if frame.len() < ETH_LEN + 20 + UDP_LEN {
        return None;
    }
    // EtherType must be IPv4 (0x0800).
    if frame[12] != 0x08 || frame[13] != 0x00 {
        return None;
    }
    let ip = &frame[ETH_LEN..];
    if ip[0] >> 4 != 4 || ip[9] != 0x11 {
        return None;
    }
    let ihl = ((ip[0] & 0x0f) as usize) * 4;
    if ihl < 20 || ip.len() < ihl + UDP_LEN {
        return None;
    }
    let src_ip = Ipv4Addr::new(ip[12], ip[13], ip[14], ip[15]);

    let udp = &ip[ihl..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    // Trust the UDP length over the capture length (Ethernet padding).
    let end = if udp_len >= UDP_LEN { udp_len.min(udp.len()) } else { udp.len() };

    Some(UdpDatagram {
        src: SocketAddr::from((src_ip, src_port)),
        dst_port,
        payload: &udp[UDP_LEN..end],
    })
}

/// Build an Ethernet + IPv4 + UDP frame around `payload`. Checksums are left 0.
pub fn build_udp_frame(src: SocketAddr, dst_ip: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = ((UDP_LEN + payload.len()) as u16).to_be_bytes();
    let ip_total = ((20 + UDP_LEN + payload.len()) as u16).to_be_bytes();
    let src_ip = match src {
        SocketAddr::V4(v4) => v4.ip().octets(),
        SocketAddr::V6(_) => [0; 4],
    };
    let src_port = src.port().to_be_bytes();
    let dst = dst_ip.octets();

    let dst_mac = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
    let src_mac = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    let ethertype = [0x08u8, 0x00];

    let ip_hdr = [
        0x45, 0x00,
        ip_total[0], ip_total[1],
        0x00, 0x00, // ID
        0x40, 0x00, // don't fragment
        64, 0x11,   // TTL=64, proto=UDP
        0x00, 0x00, // checksum
        src_ip[0], src_ip[1], src_ip[2], src_ip[3],
        dst[0], dst[1], dst[2], dst[3],
    ];

    let udp_hdr = [
        src_port[0], src_port[1],
        (dst_port >> 8) as u8, dst_port as u8,
        udp_len[0], udp_len[1],
        0x00, 0x00, // checksum
    ];

    let mut frame = Vec::with_capacity(ETH_LEN + 20 + UDP_LEN + payload.len());
    frame.extend_from_slice(&dst_mac);
    frame.extend_from_slice(&src_mac);
    frame.extend_from_slice(&ethertype);
    frame.extend_from_slice(&ip_hdr);
    frame.extend_from_slice(&udp_hdr);
    frame.extend_from_slice(payload);
    frame
}
