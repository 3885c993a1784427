//! LPD wire constants and the bit-depth dependent frame layout.
//!
//! Every FEM sends, per frame, a run of fixed-size primary packets followed by
//! one shorter tail packet. Packet counts and tail sizes are tabulated per ASIC
//! counter bit depth; the table is resolved once into a [`FrameLayout`] which is
//! handed explicitly to the assembler and the reorderer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Wire constants
// ---------------------------------------------------------------------------

pub const START_OF_FRAME_MASK: u32 = 1 << 31;
pub const END_OF_FRAME_MASK: u32 = 1 << 30;
pub const PACKET_NUMBER_MASK: u32 = 0x3FFF_FFFF;

/// Payload bytes carried by every primary packet.
pub const PRIMARY_PACKET_SIZE: usize = 8184;
pub const MAX_PRIMARY_PACKETS: usize = 320;
pub const NUM_TAIL_PACKETS: usize = 1;
/// Upper bound on packets one FEM contributes to a frame; sizes `packet_state`.
pub const MAX_FEM_PACKETS: usize = MAX_PRIMARY_PACKETS + NUM_TAIL_PACKETS;

pub const MAX_NUM_FEMS: usize = 6;

/// `packet_state` value for a packet that has not been received.
pub const MISSING_PACKET: u16 = u16::MAX;

const NUM_PRIMARY_PACKETS: [usize; 4] = [320, 320, 320, 320];
const TAIL_PACKET_SIZE: [usize; 4] = [3464, 3464, 3464, 3464];

// ---------------------------------------------------------------------------
// Bit depth
// ---------------------------------------------------------------------------

/// ASIC counter resolution selected for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    #[serde(rename = "1-bit")]
    Bits1,
    #[serde(rename = "6-bit")]
    Bits6,
    #[serde(rename = "12-bit")]
    Bits12,
    #[serde(rename = "24-bit")]
    Bits24,
}

impl BitDepth {
    pub const ALL: [BitDepth; 4] = [BitDepth::Bits1, BitDepth::Bits6, BitDepth::Bits12, BitDepth::Bits24];

    pub fn as_str(self) -> &'static str {
        match self {
            BitDepth::Bits1 => "1-bit",
            BitDepth::Bits6 => "6-bit",
            BitDepth::Bits12 => "12-bit",
            BitDepth::Bits24 => "24-bit",
        }
    }

    fn index(self) -> usize {
        match self {
            BitDepth::Bits1 => 0,
            BitDepth::Bits6 => 1,
            BitDepth::Bits12 => 2,
            BitDepth::Bits24 => 3,
        }
    }
}

impl Default for BitDepth {
    fn default() -> Self {
        BitDepth::Bits12
    }
}

impl fmt::Display for BitDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BitDepth {
    type Err = ConfigError;

    /// Accepts both the configuration spelling (`"12-bit"`) and a bare number (`"12"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let bare = trimmed.strip_suffix("-bit").unwrap_or(trimmed);
        match bare {
            "1" => Ok(BitDepth::Bits1),
            "6" => Ok(BitDepth::Bits6),
            "12" => Ok(BitDepth::Bits12),
            "24" => Ok(BitDepth::Bits24),
            _ => Err(ConfigError::UnknownBitDepth(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame layout
// ---------------------------------------------------------------------------

/// Packet geometry of one FEM's contribution to a frame.
///
/// `region_size` is the per-FEM region reserved in every frame buffer. For the
/// standard tables it is the size needed by the largest bit depth, so buffers
/// stay interchangeable when the bit depth is reconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub primary_packet_size: usize,
    pub num_primary_packets: usize,
    pub tail_packet_size: usize,
    pub region_size: usize,
}

impl FrameLayout {
    pub fn for_bit_depth(bit_depth: BitDepth) -> Self {
        let i = bit_depth.index();
        Self {
            primary_packet_size: PRIMARY_PACKET_SIZE,
            num_primary_packets: NUM_PRIMARY_PACKETS[i],
            tail_packet_size: TAIL_PACKET_SIZE[i],
            region_size: Self::max_region_size(),
        }
    }

    /// Layout with explicit packet sizes; the region is sized to fit exactly.
    /// Lets tests build frames a few bytes long.
    pub fn custom(
        primary_packet_size: usize,
        num_primary_packets: usize,
        tail_packet_size: usize,
    ) -> Result<Self, ConfigError> {
        if primary_packet_size == 0 || primary_packet_size % 2 != 0 {
            return Err(ConfigError::InvalidValue {
                key: "primary_packet_size",
                reason: format!("{} is not a positive even byte count", primary_packet_size),
            });
        }
        if tail_packet_size > primary_packet_size || tail_packet_size % 2 != 0 {
            return Err(ConfigError::InvalidValue {
                key: "tail_packet_size",
                reason: format!(
                    "{} must be even and no larger than the primary packet ({})",
                    tail_packet_size, primary_packet_size
                ),
            });
        }
        if num_primary_packets == 0 || num_primary_packets > MAX_PRIMARY_PACKETS {
            return Err(ConfigError::InvalidValue {
                key: "num_primary_packets",
                reason: format!("{} outside 1..={}", num_primary_packets, MAX_PRIMARY_PACKETS),
            });
        }
        Ok(Self {
            primary_packet_size,
            num_primary_packets,
            tail_packet_size,
            region_size: primary_packet_size * num_primary_packets + tail_packet_size,
        })
    }

    fn max_region_size() -> usize {
        BitDepth::ALL
            .iter()
            .map(|bd| {
                let i = bd.index();
                PRIMARY_PACKET_SIZE * NUM_PRIMARY_PACKETS[i] + TAIL_PACKET_SIZE[i]
            })
            .max()
            .unwrap_or(0)
    }

    /// Primary packets plus the tail packet.
    pub fn packets_per_fem(&self) -> usize {
        self.num_primary_packets + NUM_TAIL_PACKETS
    }

    /// Largest payload the packet with this number may carry, or `None` if the
    /// number is outside the frame.
    pub fn payload_capacity(&self, packet_number: usize) -> Option<usize> {
        if packet_number < self.num_primary_packets {
            Some(self.primary_packet_size)
        } else if packet_number < self.packets_per_fem() {
            Some(self.tail_packet_size)
        } else {
            None
        }
    }

    /// Byte offset of a storage slot inside a FEM region.
    pub fn slot_offset(&self, slot: usize) -> usize {
        slot * self.primary_packet_size
    }

    /// 16-bit samples carried by one primary packet.
    pub fn samples_per_packet(&self) -> usize {
        self.primary_packet_size / 2
    }

    /// 16-bit samples one FEM contributes to a frame.
    pub fn samples_per_fem(&self) -> usize {
        (self.primary_packet_size * self.num_primary_packets + self.tail_packet_size) / 2
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::for_bit_depth(BitDepth::default())
    }
}
