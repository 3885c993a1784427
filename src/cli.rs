//! CLI definitions for lpdrx.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "lpdrx",
    version,
    about = "LPD detector frame receiver\n\nReassemble FEM UDP packet streams into frames, reorder pixels into images and account packet loss.",
    long_about = None
)]
pub struct Cli {
    /// Path to lpdrx.toml config file
    #[clap(long, short, default_value = "lpdrx.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Receive live FEM traffic until Ctrl-C, writing images and a JSONL status log
    Run {
        /// Status log interval in seconds (default: from config)
        #[clap(long)]
        interval: Option<u64>,

        /// Status log path (default: from config)
        #[clap(long)]
        log: Option<PathBuf>,
    },

    /// Feed a pcap capture of FEM traffic through the pipeline and print the final status
    Replay {
        /// Capture file (Ethernet/IPv4/UDP)
        pcap: PathBuf,

        /// Write reordered images into this directory (default: from config)
        #[clap(long)]
        images: Option<PathBuf>,
    },

    /// Send synthetic FEM frames, one stream per mapped port
    Emulate {
        /// Destination host
        #[clap(long, default_value = "127.0.0.1")]
        target: IpAddr,

        /// Number of frames to send
        #[clap(long, default_value = "10")]
        frames: u32,

        /// Leave out every Nth packet of each FEM stream (0 = send everything)
        #[clap(long, default_value = "0")]
        skip_every: usize,

        /// Pause between frames in milliseconds
        #[clap(long, default_value = "100")]
        frame_interval_ms: u64,

        /// Write the packets to this pcap file instead of sending them
        #[clap(long)]
        pcap: Option<PathBuf>,
    },

    /// Show the most recent entry of the status log
    Status {
        /// Status log path (default: from config)
        #[clap(long)]
        log: Option<PathBuf>,
    },

    /// Print an example lpdrx.toml to stdout
    Init,
}
