//! Error taxonomy for the receive and reorder stages.
//!
//! None of these are fatal to the pipeline: packet errors demote to a counter,
//! reorder errors abort one frame, config errors reject one configure request.

use thiserror::Error;

/// Why a single datagram was not stored in a frame buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("malformed trailer: {0}")]
    MalformedTrailer(&'static str),
    #[error("packet received on unmapped port {0}")]
    UnroutablePacket(u16),
    #[error("packet number {packet_number} outside frame of {packets_per_fem} packets")]
    PacketOutOfRange { packet_number: u32, packets_per_fem: usize },
    #[error("payload of {len} bytes exceeds slot capacity {capacity} for packet {packet_number}")]
    OversizedPayload { packet_number: u32, len: usize, capacity: usize },
    #[error("duplicate packet {packet_number} for FEM {fem_idx} in frame {frame_number}")]
    DuplicatePacket { frame_number: u32, fem_idx: u8, packet_number: u32 },
    #[error("no frame buffer available for frame {0}")]
    BufferPoolExhausted(u32),
}

/// Failure while turning a frame buffer into output images.
#[derive(Debug, Error)]
pub enum ReorderError {
    #[error("failed to allocate {pixels} pixel output image: {source}")]
    AllocationFailure {
        pixels: usize,
        #[source]
        source: std::collections::TryReserveError,
    },
    #[error("{num_images} images of {width}x{height} pixels in {stripes} stripes exceed the addressable size")]
    ImageTooLarge { width: usize, height: usize, stripes: usize, num_images: usize },
    #[error("image sink closed")]
    SinkClosed,
}

/// Rejected configuration value. The previous configuration stays in force.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("fem_port_map is empty")]
    EmptyPortMap,
    #[error("malformed fem_port_map entry '{0}' (expected port:index)")]
    MalformedPortMapEntry(String),
    #[error("port {0} appears more than once in fem_port_map")]
    DuplicatePort(u16),
    #[error("FEM index {0} appears more than once in fem_port_map")]
    DuplicateFem(u8),
    #[error("FEM index {index} out of range (max {max})")]
    FemIndexOutOfRange { index: u32, max: usize },
    #[error("unknown bit depth '{0}'")]
    UnknownBitDepth(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("pipeline is not running")]
    PipelineStopped,
}
