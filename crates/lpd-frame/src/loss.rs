use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use crate::definitions::MAX_NUM_FEMS;
use crate::frame::FrameHeader;

// ---------------------------------------------------------------------------
// Per-frame loss
// ---------------------------------------------------------------------------

/// Packet loss of one frame, against the packets expected from its active FEMs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameLoss {
    pub frame_number: Option<u32>,
    pub expected: u64,
    pub received: u64,
    pub lost: u64,
    /// `(fem_idx, packets lost)` for every active FEM that lost packets.
    pub per_fem: Vec<(u8, u64)>,
}

impl FrameLoss {
    pub fn of(header: &FrameHeader, packets_per_fem: usize) -> Self {
        let expected = packets_per_fem as u64 * header.num_active_fems() as u64;
        let received = header.total_packets_received as u64;
        let per_fem = header
            .active_fems()
            .iter()
            .enumerate()
            .filter_map(|(pos, &fem_idx)| {
                let got = header.fem_rx_state(pos).map_or(0, |s| s.packets_received as u64);
                let lost = (packets_per_fem as u64).saturating_sub(got);
                (lost > 0).then_some((fem_idx, lost))
            })
            .collect();
        Self {
            frame_number: header.frame_number,
            expected,
            received,
            lost: expected.saturating_sub(received),
            per_fem,
        }
    }
}

// ---------------------------------------------------------------------------
// LossAccumulator
// ---------------------------------------------------------------------------

/// Running loss and diagnostic counters shared by the assemble and reorder stages.
/// All atomic writes use Relaxed ordering.
pub struct LossAccumulator {
    /// Cumulative packets lost from frames that reached loss accounting.
    pub packets_lost: AtomicU64,
    pub packets_received: AtomicU64,
    /// Packets from ports absent in the FEM map.
    pub packets_ignored: AtomicU64,
    /// Bad trailer, packet number out of range, or oversized payload.
    pub packets_malformed: AtomicU64,
    pub packets_duplicate: AtomicU64,
    /// Packets discarded because every frame buffer was downstream.
    pub packets_unbuffered: AtomicU64,
    /// Packets the receiver could not queue because the assembler fell behind.
    pub packets_overflowed: AtomicU64,

    pub frames_complete: AtomicU64,
    pub frames_timed_out: AtomicU64,
    pub frames_evicted: AtomicU64,
    pub frames_flushed: AtomicU64,
    pub frames_processed: AtomicU64,
    /// Frames whose reordering was aborted.
    pub frames_failed: AtomicU64,
    pub images_emitted: AtomicU64,

    fem_packets_lost: [AtomicU64; MAX_NUM_FEMS],
}

/// Plain-struct snapshot of LossAccumulator (no atomics).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LossSnapshot {
    pub packets_lost: u64,
    pub packets_received: u64,
    pub packets_ignored: u64,
    pub packets_malformed: u64,
    pub packets_duplicate: u64,
    pub packets_unbuffered: u64,
    pub packets_overflowed: u64,
    pub frames_complete: u64,
    pub frames_timed_out: u64,
    pub frames_evicted: u64,
    pub frames_flushed: u64,
    pub frames_processed: u64,
    pub frames_failed: u64,
    pub images_emitted: u64,
    pub fem_packets_lost: [u64; MAX_NUM_FEMS],
}

impl LossAccumulator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add one frame's loss to the running totals and return it.
    pub fn record_frame(&self, header: &FrameHeader, packets_per_fem: usize) -> FrameLoss {
        let loss = FrameLoss::of(header, packets_per_fem);
        if loss.lost > 0 {
            self.packets_lost.fetch_add(loss.lost, Relaxed);
        }
        for &(fem_idx, lost) in &loss.per_fem {
            if let Some(counter) = self.fem_packets_lost.get(fem_idx as usize) {
                counter.fetch_add(lost, Relaxed);
            }
        }
        loss
    }

    /// Overwrite the cumulative loss count (external reset or seeding).
    pub fn set_packets_lost(&self, value: u64) {
        self.packets_lost.store(value, Relaxed);
    }

    pub fn fem_packets_lost(&self, fem_idx: usize) -> u64 {
        self.fem_packets_lost.get(fem_idx).map_or(0, |c| c.load(Relaxed))
    }

    pub fn snapshot(&self) -> LossSnapshot {
        LossSnapshot {
            packets_lost: self.packets_lost.load(Relaxed),
            packets_received: self.packets_received.load(Relaxed),
            packets_ignored: self.packets_ignored.load(Relaxed),
            packets_malformed: self.packets_malformed.load(Relaxed),
            packets_duplicate: self.packets_duplicate.load(Relaxed),
            packets_unbuffered: self.packets_unbuffered.load(Relaxed),
            packets_overflowed: self.packets_overflowed.load(Relaxed),
            frames_complete: self.frames_complete.load(Relaxed),
            frames_timed_out: self.frames_timed_out.load(Relaxed),
            frames_evicted: self.frames_evicted.load(Relaxed),
            frames_flushed: self.frames_flushed.load(Relaxed),
            frames_processed: self.frames_processed.load(Relaxed),
            frames_failed: self.frames_failed.load(Relaxed),
            images_emitted: self.images_emitted.load(Relaxed),
            fem_packets_lost: std::array::from_fn(|i| self.fem_packets_lost[i].load(Relaxed)),
        }
    }
}

impl Default for LossAccumulator {
    fn default() -> Self {
        Self {
            packets_lost: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_ignored: AtomicU64::new(0),
            packets_malformed: AtomicU64::new(0),
            packets_duplicate: AtomicU64::new(0),
            packets_unbuffered: AtomicU64::new(0),
            packets_overflowed: AtomicU64::new(0),
            frames_complete: AtomicU64::new(0),
            frames_timed_out: AtomicU64::new(0),
            frames_evicted: AtomicU64::new(0),
            frames_flushed: AtomicU64::new(0),
            frames_processed: AtomicU64::new(0),
            frames_failed: AtomicU64::new(0),
            images_emitted: AtomicU64::new(0),
            fem_packets_lost: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl LossSnapshot {
    /// Flat key/value status, `fem_packets_lost/<idx>` per FEM.
    pub fn to_status(&self) -> Map<String, Value> {
        let mut status = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        status.remove("fem_packets_lost");
        for (idx, lost) in self.fem_packets_lost.iter().enumerate() {
            status.insert(format!("fem_packets_lost/{}", idx), Value::from(*lost));
        }
        status
    }
}
