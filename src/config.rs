//! `lpdrx.toml` configuration.

use anyhow::{Context, Result};
use lpd_frame::pipeline::{PipelineOptions, DEFAULT_FRAME_BUFFERS, DEFAULT_PACKET_QUEUE};
use lpd_frame::Settings;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// Top-level receiver configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RxConfig {
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// UDP sockets, one per port in `pipeline.fem_port_map`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReceiverConfig {
    /// Local address to bind the FEM data ports on.
    #[serde(default = "ReceiverConfig::default_bind_addr")]
    pub bind_addr: IpAddr,
    /// Socket receive buffer per port, in megabytes.
    #[serde(default = "ReceiverConfig::default_recv_buffer_mb")]
    pub recv_buffer_mb: usize,
    /// CPU core to pin the receiver threads to (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_recv_core: Option<usize>,
}

impl ReceiverConfig {
    fn default_bind_addr() -> IpAddr { IpAddr::from([0, 0, 0, 0]) }
    fn default_recv_buffer_mb() -> usize { 32 }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            recv_buffer_mb: Self::default_recv_buffer_mb(),
            pin_recv_core: None,
        }
    }
}

/// Decoder settings plus queue sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(flatten)]
    pub settings: Settings,
    /// Frame buffers in the pool. Each holds one frame from every FEM.
    #[serde(default = "PipelineConfig::default_frame_buffers")]
    pub frame_buffers: usize,
    /// Packets queued between the receivers and the assembler.
    #[serde(default = "PipelineConfig::default_packet_queue")]
    pub packet_queue: usize,
}

impl PipelineConfig {
    fn default_frame_buffers() -> usize { DEFAULT_FRAME_BUFFERS }
    fn default_packet_queue() -> usize { DEFAULT_PACKET_QUEUE }

    pub fn options(&self) -> PipelineOptions {
        PipelineOptions { frame_buffers: self.frame_buffers, packet_queue: self.packet_queue }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            settings: Settings::default(),
            frame_buffers: Self::default_frame_buffers(),
            packet_queue: Self::default_packet_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    /// Directory for raw image files and their index. Omit to discard images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_dir: Option<String>,
    #[serde(default = "OutputConfig::default_status_log")]
    pub status_log: String,
    #[serde(default = "OutputConfig::default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl OutputConfig {
    fn default_status_log() -> String { "lpdrx.jsonl".into() }
    fn default_status_interval_secs() -> u64 { 5 }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            image_dir: None,
            status_log: Self::default_status_log(),
            status_interval_secs: Self::default_status_interval_secs(),
        }
    }
}

impl RxConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        cfg.pipeline
            .settings
            .resolve()
            .with_context(|| format!("invalid [pipeline] settings in {}", path.display()))?;
        Ok(cfg)
    }

    /// Like [`RxConfig::load`], but a missing file means built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        tracing::info!(
            "no config at '{}'; using defaults (run `lpdrx init > {}` to create one)",
            path.display(),
            path.display()
        );
        Ok(Self::default())
    }

    pub fn recv_buffer_bytes(&self) -> usize {
        self.receiver.recv_buffer_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lpd_frame::BitDepth;

    #[test]
    fn test_parse_full_config() {
        let cfg: RxConfig = toml::from_str(
            r#"
            [receiver]
            bind_addr = "10.0.0.2"
            pin_recv_core = 3

            [pipeline]
            fem_port_map = "61649:0,61650:1"
            bit_depth = "24-bit"
            num_images = 5
            frame_buffers = 16

            [output]
            image_dir = "/data/lpd"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.receiver.bind_addr, IpAddr::from([10, 0, 0, 2]));
        assert_eq!(cfg.receiver.recv_buffer_mb, 32);
        assert_eq!(cfg.receiver.pin_recv_core, Some(3));
        assert_eq!(cfg.pipeline.settings.fem_port_map, "61649:0,61650:1");
        assert_eq!(cfg.pipeline.settings.bit_depth, BitDepth::Bits24);
        assert_eq!(cfg.pipeline.settings.num_images, 5);
        assert_eq!(cfg.pipeline.settings.image_width, 256);
        assert_eq!(cfg.pipeline.frame_buffers, 16);
        assert_eq!(cfg.pipeline.packet_queue, DEFAULT_PACKET_QUEUE);
        assert_eq!(cfg.output.image_dir.as_deref(), Some("/data/lpd"));
        assert_eq!(cfg.output.status_interval_secs, 5);
    }

    #[test]
    fn test_empty_config_is_default() {
        let cfg: RxConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.pipeline.settings, Settings::default());
        assert_eq!(cfg.output.status_log, "lpdrx.jsonl");
    }

    #[test]
    fn test_default_serialises_and_reloads() {
        let text = toml::to_string_pretty(&RxConfig::default()).unwrap();
        let cfg: RxConfig = toml::from_str(&text).unwrap();
        assert_eq!(cfg.pipeline.settings, Settings::default());
        assert_eq!(cfg.pipeline.frame_buffers, DEFAULT_FRAME_BUFFERS);
    }
}
