//! Packet trailer codec.
//!
//! Every FEM datagram is `payload ++ trailer`. The trailer is read from the
//! last `TRAILER_SIZE` bytes of the datagram.

use crate::definitions::{END_OF_FRAME_MASK, PACKET_NUMBER_MASK, START_OF_FRAME_MASK};
use crate::error::PacketError;

// ---------------------------------------------------------------------------
// Trailer layout (both words little-endian, as laid out by the x86 hosts)
//
//   Bytes 0 .. 3 = frame_number        (u32)
//   Bytes 4 .. 7 = packet_number_flags (u32)
//                    bit 31     = start of frame
//                    bit 30     = end of frame
//                    bits 0..29 = packet number within the frame, per FEM
// ---------------------------------------------------------------------------

pub const TRAILER_SIZE: usize = 8;
const FRAME_NUMBER_OFF: usize = 0;
const PACKET_FLAGS_OFF: usize = 4;

/// Decoded routing and sequencing metadata of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketTrailer {
    pub frame_number: u32,
    pub packet_number: u32,
    pub start_of_frame: bool,
    pub end_of_frame: bool,
}

impl PacketTrailer {
    /// Decode a trailer from the first `TRAILER_SIZE` bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < TRAILER_SIZE {
            return Err(PacketError::MalformedTrailer("trailer shorter than 8 bytes"));
        }
        let frame_number = read_u32(bytes, FRAME_NUMBER_OFF);
        let flags = read_u32(bytes, PACKET_FLAGS_OFF);
        Ok(Self {
            frame_number,
            packet_number: flags & PACKET_NUMBER_MASK,
            start_of_frame: flags & START_OF_FRAME_MASK != 0,
            end_of_frame: flags & END_OF_FRAME_MASK != 0,
        })
    }

    /// Split a datagram into its payload and decoded trailer.
    pub fn split(datagram: &[u8]) -> Result<(&[u8], Self), PacketError> {
        if datagram.len() < TRAILER_SIZE {
            return Err(PacketError::MalformedTrailer("datagram shorter than trailer"));
        }
        let (payload, trailer) = datagram.split_at(datagram.len() - TRAILER_SIZE);
        Ok((payload, Self::decode(trailer)?))
    }

    /// Packed flags word; packet numbers wider than 30 bits are truncated.
    pub fn packet_number_flags(&self) -> u32 {
        let mut flags = self.packet_number & PACKET_NUMBER_MASK;
        if self.start_of_frame {
            flags |= START_OF_FRAME_MASK;
        }
        if self.end_of_frame {
            flags |= END_OF_FRAME_MASK;
        }
        flags
    }

    pub fn encode(&self) -> [u8; TRAILER_SIZE] {
        let mut out = [0u8; TRAILER_SIZE];
        out[FRAME_NUMBER_OFF..FRAME_NUMBER_OFF + 4].copy_from_slice(&self.frame_number.to_le_bytes());
        out[PACKET_FLAGS_OFF..PACKET_FLAGS_OFF + 4]
            .copy_from_slice(&self.packet_number_flags().to_le_bytes());
        out
    }

    /// Append the encoded trailer to `payload`, producing a wire datagram.
    pub fn append_to(&self, payload: &mut Vec<u8>) {
        payload.extend_from_slice(&self.encode());
    }
}

fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trailer(frame_number: u32, packet_number: u32, sof: bool, eof: bool) -> PacketTrailer {
        PacketTrailer { frame_number, packet_number, start_of_frame: sof, end_of_frame: eof }
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let cases = [
            trailer(0, 0, true, false),
            trailer(3, 320, false, true),
            trailer(u32::MAX, PACKET_NUMBER_MASK, true, true),
            trailer(0x1234_5678, 17, false, false),
        ];
        for t in cases {
            assert_eq!(PacketTrailer::decode(&t.encode()).unwrap(), t);
        }
    }

    #[test]
    fn test_flag_bits_on_wire() {
        let bytes = trailer(7, 5, true, false).encode();
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 0x8000_0005);

        let bytes = trailer(7, 320, false, true).encode();
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 0x4000_0140);
    }

    #[test]
    fn test_decode_masks_flags_out_of_packet_number() {
        let mut bytes = [0u8; TRAILER_SIZE];
        bytes[4..8].copy_from_slice(&0xC000_0002u32.to_le_bytes());
        let t = PacketTrailer::decode(&bytes).unwrap();
        assert_eq!(t.packet_number, 2);
        assert!(t.start_of_frame);
        assert!(t.end_of_frame);
    }

    #[test]
    fn test_undersized_is_malformed() {
        assert!(matches!(
            PacketTrailer::decode(&[0u8; 7]),
            Err(PacketError::MalformedTrailer(_))
        ));
        assert!(matches!(
            PacketTrailer::split(&[0u8; 3]),
            Err(PacketError::MalformedTrailer(_))
        ));
    }

    #[test]
    fn test_split_separates_payload() {
        let mut datagram = vec![0xAA; 16];
        trailer(9, 1, false, false).append_to(&mut datagram);
        let (payload, t) = PacketTrailer::split(&datagram).unwrap();
        assert_eq!(payload, &[0xAA; 16][..]);
        assert_eq!(t.frame_number, 9);
        assert_eq!(t.packet_number, 1);

        let encoded = trailer(1, 0, true, false).encode();
        let (payload, _) = PacketTrailer::split(&encoded).unwrap();
        assert!(payload.is_empty());
    }
}
