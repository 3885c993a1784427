//! `lpdrx emulate`: synthetic FEM traffic.
//!
//! Generates frames in the configured bit-depth layout, one packet stream per
//! port of the FEM map, and either sends them over UDP or writes them to a
//! pcap file for `lpdrx replay`. Pixel values are a per-FEM ramp so reordered
//! images are easy to eyeball.

use anyhow::{Context, Result};
use lpd_frame::{FemPortMap, FrameLayout, PacketTrailer};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use std::fs::File;
use std::io::BufWriter;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::RxConfig;
use crate::wire::build_udp_frame;

pub struct EmulateOptions {
    pub target: IpAddr,
    pub frames: u32,
    /// Leave out every Nth packet of each FEM stream; 0 sends everything.
    pub skip_every: usize,
    pub frame_interval_ms: u64,
    pub pcap: Option<PathBuf>,
}

/// One FEM datagram, with the port it is addressed to.
struct FemPacket {
    fem_idx: u8,
    port: u16,
    datagram: Vec<u8>,
}

pub fn run(config: &RxConfig, opts: &EmulateOptions) -> Result<()> {
    if let Some(path) = &opts.pcap {
        let written = write_pcap(config, opts, path)?;
        eprintln!("wrote {} packets to {}", written, path.display());
        return Ok(());
    }

    let socket = UdpSocket::bind(SocketAddr::new(
        if opts.target.is_ipv4() { IpAddr::from([0, 0, 0, 0]) } else { IpAddr::from([0u16; 8]) },
        0,
    ))?;
    let mut sent: u64 = 0;
    for frame_number in 1..=opts.frames {
        for pkt in frame_packets(config, opts, frame_number)? {
            socket
                .send_to(&pkt.datagram, SocketAddr::new(opts.target, pkt.port))
                .with_context(|| format!("send to {}:{}", opts.target, pkt.port))?;
            sent += 1;
        }
        tracing::debug!(frame = frame_number, "frame sent");
        if opts.frame_interval_ms > 0 {
            std::thread::sleep(Duration::from_millis(opts.frame_interval_ms));
        }
    }
    eprintln!("sent {} frames ({} packets) to {}", opts.frames, sent, opts.target);
    Ok(())
}

fn pcap_header() -> PcapHeader {
    PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: 65535,
        datalink: DataLink::ETHERNET,
        ts_resolution: TsResolution::NanoSecond,
        endianness: Endianness::native(),
    }
}

/// Write every emulated frame to `path`. Returns the number of packets written.
pub fn write_pcap(config: &RxConfig, opts: &EmulateOptions, path: &Path) -> Result<u64> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = PcapWriter::with_header(BufWriter::new(file), pcap_header())?;
    let dst_ip = match opts.target {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => Ipv4Addr::LOCALHOST,
    };

    let mut written: u64 = 0;
    let mut ts = Duration::ZERO;
    for frame_number in 1..=opts.frames {
        for pkt in frame_packets(config, opts, frame_number)? {
            let src = SocketAddr::from(([10, 0, 0, 100 + pkt.fem_idx], 50_000 + pkt.fem_idx as u16));
            let frame = build_udp_frame(src, dst_ip, pkt.port, &pkt.datagram);
            writer.write_packet(&PcapPacket::new(ts, frame.len() as u32, &frame))?;
            ts += Duration::from_micros(1);
            written += 1;
        }
        ts += Duration::from_millis(opts.frame_interval_ms);
    }
    Ok(written)
}

/// All packets of one frame, FEM streams interleaved packet by packet.
fn frame_packets(config: &RxConfig, opts: &EmulateOptions, frame_number: u32) -> Result<Vec<FemPacket>> {
    let settings = &config.pipeline.settings;
    let layout = FrameLayout::for_bit_depth(settings.bit_depth);
    let port_map = FemPortMap::parse(&settings.fem_port_map)?;
    let ports = port_map.ports();
    let spp = layout.samples_per_packet();
    let ppf = layout.packets_per_fem();

    let mut packets = Vec::with_capacity(ppf * ports.len());
    for packet_number in 0..ppf {
        if opts.skip_every > 0 && (packet_number + 1) % opts.skip_every == 0 {
            continue;
        }
        let Some(len) = layout.payload_capacity(packet_number) else { continue };
        for &port in &ports {
            let Some(entry) = port_map.lookup(port) else { continue };
            let base = entry.fem_idx as usize * 1000 + packet_number * spp;
            let mut datagram: Vec<u8> = (0..len / 2)
                .flat_map(|o| (((base + o) % 4096) as u16).to_le_bytes())
                .collect();
            PacketTrailer {
                frame_number,
                packet_number: packet_number as u32,
                start_of_frame: packet_number == 0,
                end_of_frame: packet_number == ppf - 1,
            }
            .append_to(&mut datagram);
            packets.push(FemPacket { fem_idx: entry.fem_idx, port, datagram });
        }
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(skip_every: usize) -> EmulateOptions {
        EmulateOptions {
            target: IpAddr::from([127, 0, 0, 1]),
            frames: 1,
            skip_every,
            frame_interval_ms: 0,
            pcap: None,
        }
    }

    #[test]
    fn test_frame_packets_cover_every_fem() {
        let mut config = RxConfig::default();
        config.pipeline.settings.fem_port_map = "61649:0,61650:3".into();
        let packets = frame_packets(&config, &opts(0), 9).unwrap();
        assert_eq!(packets.len(), 2 * 321);

        let (payload, trailer) = PacketTrailer::split(&packets[0].datagram).unwrap();
        assert_eq!(payload.len(), 8184);
        assert_eq!(trailer.frame_number, 9);
        assert!(trailer.start_of_frame);

        let last = packets.last().unwrap();
        assert_eq!(last.fem_idx, 3);
        let (tail, trailer) = PacketTrailer::split(&last.datagram).unwrap();
        assert_eq!(tail.len(), 3464);
        assert_eq!(trailer.packet_number, 320);
        assert!(trailer.end_of_frame);
    }

    #[test]
    fn test_skip_every() {
        let config = RxConfig::default();
        let packets = frame_packets(&config, &opts(2), 1).unwrap();
        assert_eq!(packets.len(), 161);
    }
}
