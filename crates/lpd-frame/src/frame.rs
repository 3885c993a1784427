//! Frame buffers: the typed header, per-FEM receive state and the payload arena.
//!
//! A [`FrameBuffer`] is a header handle plus one byte arena holding
//! `MAX_NUM_FEMS` fixed-size FEM regions. FEMs take regions in the order their
//! first packet arrives. Buffers live in a fixed-capacity [`FramePool`] and move
//! by value between the assembler and the reorderer, so one buffer can never be
//! owned by two frame numbers at once.

use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::time::SystemTime;

use crate::definitions::{FrameLayout, MAX_FEM_PACKETS, MAX_NUM_FEMS, MISSING_PACKET};

// ---------------------------------------------------------------------------
// Frame state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameState {
    /// In the pool, no frame assigned.
    Empty,
    /// At least one packet stored, not yet complete.
    Receiving,
    /// Every active FEM delivered every packet with one SOF and one EOF marker.
    Complete,
    /// Timed out, evicted under buffer pressure, or flushed on stop.
    Dropped,
}

// ---------------------------------------------------------------------------
// Per-FEM receive state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FemReceiveState {
    pub packets_received: u32,
    pub sof_marker_count: u8,
    pub eof_marker_count: u8,
    /// Storage slot per packet number, or `MISSING_PACKET`.
    packet_state: [u16; MAX_FEM_PACKETS],
}

impl FemReceiveState {
    pub fn new() -> Self {
        Self {
            packets_received: 0,
            sof_marker_count: 0,
            eof_marker_count: 0,
            packet_state: [MISSING_PACKET; MAX_FEM_PACKETS],
        }
    }

    fn reset(&mut self) {
        self.packets_received = 0;
        self.sof_marker_count = 0;
        self.eof_marker_count = 0;
        self.packet_state.fill(MISSING_PACKET);
    }

    /// Record that `packet_number` was stored in `slot`.
    /// Returns false, leaving the state untouched, for a duplicate.
    pub(crate) fn record(&mut self, packet_number: usize, slot: u16) -> bool {
        match self.packet_state.get_mut(packet_number) {
            Some(entry) if *entry == MISSING_PACKET => {
                *entry = slot;
                self.packets_received += 1;
                true
            }
            _ => false,
        }
    }

    pub fn has_packet(&self, packet_number: usize) -> bool {
        self.slot(packet_number).is_some()
    }

    /// Storage slot of a received packet.
    #[inline]
    pub fn slot(&self, packet_number: usize) -> Option<u16> {
        match self.packet_state.get(packet_number) {
            Some(&slot) if slot != MISSING_PACKET => Some(slot),
            _ => None,
        }
    }

    pub fn packet_state(&self) -> &[u16] {
        &self.packet_state
    }

    pub fn is_complete(&self, packets_per_fem: usize) -> bool {
        self.sof_marker_count == 1
            && self.eof_marker_count == 1
            && self.packets_received as usize == packets_per_fem
    }
}

impl Default for FemReceiveState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Frame header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FrameHeader {
    /// `None` while the buffer is unassigned.
    pub frame_number: Option<u32>,
    pub frame_state: FrameState,
    /// Wall-clock time the first packet of the frame arrived.
    pub frame_start_time: Option<SystemTime>,
    pub total_packets_received: u32,
    pub total_sof_marker_count: u32,
    pub total_eof_marker_count: u32,
    num_active_fems: u8,
    active_fem_idx: [u8; MAX_NUM_FEMS],
    fem_rx_state: [FemReceiveState; MAX_NUM_FEMS],
}

impl FrameHeader {
    pub fn new() -> Self {
        Self {
            frame_number: None,
            frame_state: FrameState::Empty,
            frame_start_time: None,
            total_packets_received: 0,
            total_sof_marker_count: 0,
            total_eof_marker_count: 0,
            num_active_fems: 0,
            active_fem_idx: [0; MAX_NUM_FEMS],
            fem_rx_state: std::array::from_fn(|_| FemReceiveState::new()),
        }
    }

    fn reset(&mut self) {
        self.frame_number = None;
        self.frame_state = FrameState::Empty;
        self.frame_start_time = None;
        self.total_packets_received = 0;
        self.total_sof_marker_count = 0;
        self.total_eof_marker_count = 0;
        for state in &mut self.fem_rx_state[..self.num_active_fems as usize] {
            state.reset();
        }
        self.num_active_fems = 0;
        self.active_fem_idx = [0; MAX_NUM_FEMS];
    }

    pub(crate) fn claim(&mut self, frame_number: u32, start: SystemTime) {
        self.reset();
        self.frame_number = Some(frame_number);
        self.frame_state = FrameState::Receiving;
        self.frame_start_time = Some(start);
    }

    pub fn num_active_fems(&self) -> usize {
        self.num_active_fems as usize
    }

    /// Logical FEM indices in order of first arrival.
    pub fn active_fems(&self) -> &[u8] {
        &self.active_fem_idx[..self.num_active_fems as usize]
    }

    /// Arrival position (and region index) of a FEM, if it has sent a packet.
    pub fn fem_position(&self, fem_idx: u8) -> Option<usize> {
        self.active_fems().iter().position(|&f| f == fem_idx)
    }

    /// Position of `fem_idx`, registering it on first sight. `None` when all
    /// `MAX_NUM_FEMS` positions are taken by other FEMs.
    pub(crate) fn activate_fem(&mut self, fem_idx: u8) -> Option<usize> {
        if let Some(pos) = self.fem_position(fem_idx) {
            return Some(pos);
        }
        let pos = self.num_active_fems as usize;
        if pos >= MAX_NUM_FEMS {
            return None;
        }
        self.active_fem_idx[pos] = fem_idx;
        self.num_active_fems += 1;
        Some(pos)
    }

    pub fn fem_rx_state(&self, position: usize) -> Option<&FemReceiveState> {
        if position < self.num_active_fems as usize {
            self.fem_rx_state.get(position)
        } else {
            None
        }
    }

    pub(crate) fn fem_rx_state_mut(&mut self, position: usize) -> &mut FemReceiveState {
        &mut self.fem_rx_state[position]
    }

    /// Highest logical FEM index that contributed, if any.
    pub fn max_active_fem_idx(&self) -> Option<u8> {
        self.active_fems().iter().copied().max()
    }

    /// True once `expected_fems` FEMs are active and each delivered a full,
    /// correctly delimited packet run.
    pub fn is_complete(&self, packets_per_fem: usize, expected_fems: usize) -> bool {
        let active = self.num_active_fems as usize;
        active > 0
            && active >= expected_fems
            && self.fem_rx_state[..active].iter().all(|s| s.is_complete(packets_per_fem))
    }
}

impl Default for FrameHeader {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Frame buffer arena
// ---------------------------------------------------------------------------

pub struct FrameBuffer {
    header: FrameHeader,
    arena: Box<[u8]>,
    region_size: usize,
}

impl FrameBuffer {
    pub fn new(region_size: usize) -> Self {
        Self {
            header: FrameHeader::new(),
            arena: vec![0u8; region_size * MAX_NUM_FEMS].into_boxed_slice(),
            region_size,
        }
    }

    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut FrameHeader {
        &mut self.header
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Raw payload region of the FEM at arrival `position`.
    pub fn fem_region(&self, position: usize) -> Option<&[u8]> {
        if position >= MAX_NUM_FEMS {
            return None;
        }
        let start = position * self.region_size;
        self.arena.get(start..start + self.region_size)
    }

    /// Copy a packet payload into the `slot_len` byte slot at `offset` of
    /// `position`'s region, zero-filling whatever the payload leaves uncovered.
    /// Returns false if the slot does not fit inside the region.
    pub(crate) fn write_slot(
        &mut self,
        position: usize,
        offset: usize,
        slot_len: usize,
        payload: &[u8],
    ) -> bool {
        if position >= MAX_NUM_FEMS || payload.len() > slot_len || offset + slot_len > self.region_size {
            return false;
        }
        let start = position * self.region_size + offset;
        let slot = &mut self.arena[start..start + slot_len];
        slot[..payload.len()].copy_from_slice(payload);
        slot[payload.len()..].fill(0);
        true
    }

    /// Detach the buffer from its frame. Payload bytes are left in place;
    /// `packet_state` decides what is read back.
    pub fn reset(&mut self) {
        self.header.reset();
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("frame_number", &self.header.frame_number)
            .field("frame_state", &self.header.frame_state)
            .field("num_active_fems", &self.header.num_active_fems)
            .field("region_size", &self.region_size)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Fixed set of pre-allocated frame buffers.
///
/// Free buffers sit in a bounded channel; checkout never blocks. Released
/// buffers are reset before they go back, from whichever thread releases them.
pub struct FramePool {
    free_tx: Sender<FrameBuffer>,
    free_rx: Receiver<FrameBuffer>,
    capacity: usize,
    region_size: usize,
}

impl FramePool {
    pub fn new(layout: &FrameLayout, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (free_tx, free_rx) = crossbeam_channel::bounded(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel is sized to the buffer count.
            let _ = free_tx.try_send(FrameBuffer::new(layout.region_size));
        }
        tracing::debug!(
            capacity,
            region_size = layout.region_size,
            "frame pool allocated {} MB",
            capacity * layout.region_size * MAX_NUM_FEMS / (1024 * 1024)
        );
        Self { free_tx, free_rx, capacity, region_size: layout.region_size }
    }

    pub fn checkout(&self) -> Option<FrameBuffer> {
        self.free_rx.try_recv().ok()
    }

    pub fn release(&self, buffer: FrameBuffer) {
        release_into(&self.free_tx, buffer);
    }

    /// Cloneable handle for returning buffers from another thread.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle { free_tx: self.free_tx.clone() }
    }

    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Read side of the free list, for observing `available()` elsewhere.
    pub(crate) fn free_receiver(&self) -> Receiver<FrameBuffer> {
        self.free_rx.clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }
}

#[derive(Clone)]
pub struct PoolHandle {
    free_tx: Sender<FrameBuffer>,
}

impl PoolHandle {
    pub fn release(&self, buffer: FrameBuffer) {
        release_into(&self.free_tx, buffer);
    }
}

fn release_into(tx: &Sender<FrameBuffer>, mut buffer: FrameBuffer) {
    buffer.reset();
    if tx.try_send(buffer).is_err() {
        tracing::warn!("frame pool full or closed; discarding returned buffer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_state_counts_match_slots() {
        let mut state = FemReceiveState::new();
        assert!(state.record(0, 0));
        assert!(state.record(5, 5));
        assert!(!state.record(5, 5), "duplicate rejected");
        assert!(!state.record(MAX_FEM_PACKETS, 0), "out of range rejected");

        let stored = state.packet_state().iter().filter(|&&s| s != MISSING_PACKET).count();
        assert_eq!(state.packets_received as usize, stored);
        assert_eq!(state.slot(5), Some(5));
        assert_eq!(state.slot(1), None);
        assert!(state.has_packet(0));
    }

    #[test]
    fn test_receive_state_completion_needs_markers() {
        let mut state = FemReceiveState::new();
        for i in 0..4 {
            state.record(i, i as u16);
        }
        assert!(!state.is_complete(4));
        state.sof_marker_count = 1;
        state.eof_marker_count = 1;
        assert!(state.is_complete(4));
        state.eof_marker_count = 2;
        assert!(!state.is_complete(4));
    }

    #[test]
    fn test_activate_fem_is_unique_and_ordered() {
        let mut header = FrameHeader::new();
        header.claim(1, SystemTime::now());
        assert_eq!(header.activate_fem(3), Some(0));
        assert_eq!(header.activate_fem(1), Some(1));
        assert_eq!(header.activate_fem(3), Some(0));
        assert_eq!(header.active_fems(), &[3, 1]);
        assert_eq!(header.max_active_fem_idx(), Some(3));
        assert!(header.fem_rx_state(2).is_none());
    }

    #[test]
    fn test_activate_fem_capacity() {
        let mut header = FrameHeader::new();
        for i in 0..MAX_NUM_FEMS as u8 {
            assert_eq!(header.activate_fem(i), Some(i as usize));
        }
        assert_eq!(header.activate_fem(200), None);
    }

    #[test]
    fn test_header_completion_requires_expected_fems() {
        let mut header = FrameHeader::new();
        header.claim(1, SystemTime::now());
        let pos = header.activate_fem(0).unwrap();
        let state = header.fem_rx_state_mut(pos);
        for i in 0..2 {
            state.record(i, i as u16);
        }
        state.sof_marker_count = 1;
        state.eof_marker_count = 1;
        assert!(header.is_complete(2, 1));
        assert!(!header.is_complete(2, 2));
    }

    #[test]
    fn test_reset_clears_receive_state() {
        let mut buffer = FrameBuffer::new(16);
        buffer.header_mut().claim(4, SystemTime::now());
        let pos = buffer.header_mut().activate_fem(2).unwrap();
        buffer.header_mut().fem_rx_state_mut(pos).record(0, 0);
        buffer.reset();

        let header = buffer.header();
        assert_eq!(header.frame_number, None);
        assert_eq!(header.frame_state, FrameState::Empty);
        assert_eq!(header.num_active_fems(), 0);
        assert_eq!(header.fem_rx_state[0].packets_received, 0);
        assert!(header.fem_rx_state[0].packet_state().iter().all(|&s| s == MISSING_PACKET));
    }

    #[test]
    fn test_region_bounds() {
        let mut buffer = FrameBuffer::new(8);
        assert!(buffer.write_slot(1, 4, 4, &[1, 2, 3, 4]));
        assert!(!buffer.write_slot(1, 6, 4, &[1, 2, 3]));
        assert!(!buffer.write_slot(1, 0, 2, &[1, 2, 3]));
        assert!(!buffer.write_slot(MAX_NUM_FEMS, 0, 1, &[1]));
        assert_eq!(buffer.fem_region(1).unwrap(), &[0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(buffer.fem_region(MAX_NUM_FEMS).is_none());

        assert!(buffer.write_slot(1, 4, 4, &[9]));
        assert_eq!(buffer.fem_region(1).unwrap(), &[0, 0, 0, 0, 9, 0, 0, 0]);
    }

    #[test]
    fn test_pool_checkout_and_release() {
        let layout = FrameLayout::custom(8, 3, 8).unwrap();
        let pool = FramePool::new(&layout, 2);
        let a = pool.checkout().unwrap();
        let mut b = pool.checkout().unwrap();
        assert!(pool.checkout().is_none());
        assert_eq!(pool.available(), 0);

        b.header_mut().claim(9, SystemTime::now());
        pool.handle().release(b);
        pool.release(a);
        assert_eq!(pool.available(), 2);
        let again = pool.checkout().unwrap();
        assert_eq!(again.header().frame_number, None);
        assert_eq!(again.region_size(), 32);
    }
}
