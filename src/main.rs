//! lpdrx: LPD detector frame receiver.
//!
//! Reassembles FEM UDP packet streams into frames and reorders their pixels
//! into images. Run `lpdrx --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod color;
mod config;
mod emulate;
mod replay;
mod run;
mod sink;
mod status;
mod wire;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            print!("{}", toml::to_string_pretty(&config::RxConfig::default())?);
        }
        Commands::Run { interval, log } => {
            let config = config::RxConfig::load_or_default(&cli.config)?;
            run::run(&config, interval, log)?;
        }
        Commands::Replay { pcap, images } => {
            let config = config::RxConfig::load_or_default(&cli.config)?;
            replay::run(&config, &pcap, images)?;
        }
        Commands::Emulate { target, frames, skip_every, frame_interval_ms, pcap } => {
            let config = config::RxConfig::load_or_default(&cli.config)?;
            let opts = emulate::EmulateOptions { target, frames, skip_every, frame_interval_ms, pcap };
            emulate::run(&config, &opts)?;
        }
        Commands::Status { log } => {
            let config = config::RxConfig::load_or_default(&cli.config)?;
            status::run(&log.unwrap_or_else(|| config.output.status_log.clone().into()))?;
        }
    }

    Ok(())
}
