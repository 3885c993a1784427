//! `lpdrx replay`: run a pcap capture of FEM traffic through the pipeline.
//!
//! UDP destination ports stand in for the local ports the live receiver would
//! have tagged packets with. Packets are queued blocking, so a fast replay
//! never overflows the queue and loss figures match the capture.

use anyhow::Result;
use lpd_frame::{Pipeline, RawPacket};
use pcap_file::pcap::PcapReader;
use serde_json::{Map, Value};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::color;
use crate::config::RxConfig;
use crate::sink::ImageWriter;
use crate::wire::parse_udp_frame;

pub fn run(config: &RxConfig, pcap: &Path, images: Option<PathBuf>) -> Result<()> {
    let status = replay(config, pcap, images)?;
    print_summary(pcap, &status);
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Replay `pcap` and return the pipeline status after the final flush.
pub fn replay(config: &RxConfig, pcap: &Path, images: Option<PathBuf>) -> Result<Map<String, Value>> {
    let file = File::open(pcap)?;
    let mut reader = PcapReader::new(file)?;

    let image_dir = images.or_else(|| config.output.image_dir.clone().map(PathBuf::from));
    let sink = ImageWriter::create(image_dir.as_deref())?;
    let mut pipeline = Pipeline::start(config.pipeline.settings.clone(), config.pipeline.options(), sink)?;

    let mut frames_read: u64 = 0;
    let mut non_udp: u64 = 0;

    while let Some(pkt_result) = reader.next_packet() {
        let pkt = match pkt_result {
            Ok(p) => p,
            Err(e) => {
                warn!("pcap read error: {}", e);
                continue;
            }
        };
        frames_read += 1;

        let Some(dgram) = parse_udp_frame(&pkt.data) else {
            non_udp += 1;
            continue;
        };
        let packet = RawPacket {
            data: dgram.payload.to_vec(),
            port: dgram.dst_port,
            from: Some(dgram.src),
            recv_timestamp_ns: lpd_frame::metrics::now_ns(),
        };
        if !pipeline.submit_blocking(packet) {
            anyhow::bail!("pipeline stopped during replay");
        }
    }

    pipeline.stop();
    tracing::info!(frames_read, non_udp, "replay finished");

    let mut status = pipeline.status();
    status.insert("pcap_frames_read".into(), Value::from(frames_read));
    status.insert("pcap_non_udp".into(), Value::from(non_udp));
    Ok(status)
}

fn print_summary(pcap: &Path, status: &Map<String, Value>) {
    let get = |key: &str| status.get(key).and_then(Value::as_u64).unwrap_or(0);
    let width = 72;
    println!("{}", color::bold(&"=".repeat(width)));
    println!("{}", color::bold_cyan(&format!("{:^width$}", format!(" REPLAY  {} ", pcap.display()))));
    println!("{}", color::bold(&"=".repeat(width)));
    println!("  packets received   {:>12}", get("packets_received"));
    println!("  frames complete    {:>12}", get("frames_complete"));
    let incomplete = get("frames_timed_out") + get("frames_evicted") + get("frames_flushed");
    let frames = if incomplete > 0 { color::yellow(&incomplete.to_string()) } else { incomplete.to_string() };
    println!("  frames incomplete  {:>12}", frames);
    let lost = get("packets_lost");
    let lost_str = if lost > 0 { color::red(&lost.to_string()) } else { color::green(&lost.to_string()) };
    println!("  packets lost       {:>12}", lost_str);
    println!("  images emitted     {:>12}", get("images_emitted"));
    println!();
}
